//! Unified error type.

use std::any::Any;
use std::fmt;
use std::time::Duration;

/// Boxed error from a transport implementation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type returned by courier's fallible operations.
///
/// Application-level outcomes (404, 503, etc.) are expressed as ordinary
/// responses, not as `Error`s. This type surfaces the faults that prevented a
/// response from being produced at all.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The merged request options did not describe a sendable request.
    #[error("invalid request: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Connection refused, DNS failure, protocol error, and the like.
    #[error("transport: {0}")]
    Transport(#[source] BoxError),

    /// The call outlived the timeout configured on its descriptor.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's cancellation token fired before the call completed.
    #[error("request canceled")]
    Canceled,

    /// The response body was already delivered (stream mode) or taken.
    #[error("response body already consumed")]
    BodyConsumed,

    /// A server handler panicked. Only ever produced by the server side.
    #[error(transparent)]
    HandlerPanic(#[from] HandlerPanic),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn transport(e: impl Into<BoxError>) -> Self {
        Self::Transport(e.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
    }

    pub fn is_descriptor(&self) -> bool {
        matches!(self, Self::Descriptor(_))
    }
}

/// Why a set of request options could not be turned into a descriptor.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("no URL configured")]
    MissingUrl,

    #[error("invalid URL `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("URL `{0}` is not a valid request target")]
    InvalidTarget(String),

    #[error("unsupported URL scheme `{0}`")]
    UnsupportedScheme(String),

    #[error("invalid proxy URL `{0}`")]
    InvalidProxy(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("streaming request body was already sent")]
    BodyConsumed,
}

/// A recovered handler panic.
///
/// Inserted into the extensions of the `500` response the server produces in
/// its place, so outer middleware can tell a recovered panic from an ordinary
/// error response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerPanic {
    message: String,
}

impl HandlerPanic {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HandlerPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler panicked: {}", self.message)
    }
}

impl std::error::Error for HandlerPanic {}
