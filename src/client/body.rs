//! Request and response bodies.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use crate::error::{DescriptorError, Error};

/// A response body as handed back by a transport.
pub type ResponseBody = UnsyncBoxBody<Bytes, Error>;

type ChunkStream = BoxStream<'static, io::Result<Bytes>>;

/// The body source of an outgoing request.
///
/// `Stream` bodies can be sent once. Clones of a descriptor share the same
/// underlying reader, and whichever request takes it first wins.
#[derive(Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Full(Bytes),
    Stream(StreamSlot),
}

impl RequestBody {
    /// Wraps a byte stream.
    pub fn stream<S>(stream: S) -> Self
    where
        S: futures_util::Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self::Stream(StreamSlot(Arc::new(Mutex::new(Some(stream.boxed())))))
    }

    /// Wraps an async reader, read in chunks as the transport writes.
    pub fn reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self::stream(ReaderStream::new(Box::pin(reader)))
    }

    /// In-memory bytes, if this body has them.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Full(b) => Some(b),
            _ => None,
        }
    }

    /// A copy that can be sent again, or `None` for streaming bodies.
    pub fn try_clone(&self) -> Option<Self> {
        match self {
            Self::Stream(_) => None,
            other => Some(other.clone()),
        }
    }

    /// Length when known up front.
    pub fn size_hint(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Full(b) => Some(b.len() as u64),
            Self::Stream(_) => None,
        }
    }

    /// Detaches this body for one send, leaving a consumed slot behind for
    /// anyone sharing the stream.
    pub(crate) fn claim(&self) -> Result<Self, DescriptorError> {
        match self {
            Self::Stream(slot) => {
                let stream = slot.take().ok_or(DescriptorError::BodyConsumed)?;
                Ok(Self::Stream(StreamSlot(Arc::new(Mutex::new(Some(stream))))))
            }
            other => Ok(other.clone()),
        }
    }

    /// Converts into the body type hyper sends.
    pub fn into_http_body(self) -> UnsyncBoxBody<Bytes, Error> {
        match self {
            Self::Empty => Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync(),
            Self::Full(b) => Full::new(b).map_err(|never| match never {}).boxed_unsync(),
            Self::Stream(slot) => match slot.take() {
                Some(stream) => {
                    let frames = stream.map_ok(Frame::data).map_err(Error::from);
                    StreamBody::new(frames).boxed_unsync()
                }
                None => Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync(),
            },
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(b: Bytes) -> Self {
        Self::Full(b)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(b: Vec<u8>) -> Self {
        Self::Full(b.into())
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        Self::Full(s.into())
    }
}

impl From<&'static str> for RequestBody {
    fn from(s: &'static str) -> Self {
        Self::Full(Bytes::from_static(s.as_bytes()))
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Full(b) => f.debug_tuple("Full").field(&b.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// A take-once handle on a streaming body.
#[derive(Clone)]
pub struct StreamSlot(Arc<Mutex<Option<ChunkStream>>>);

impl StreamSlot {
    fn take(&self) -> Option<ChunkStream> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn full_body_collects() {
        let body = RequestBody::from("abc").into_http_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"abc");
    }

    #[tokio::test]
    async fn reader_body_streams_all_chunks() {
        let body = RequestBody::reader(&b"hello world"[..]);
        assert!(body.try_clone().is_none());
        assert_eq!(body.size_hint(), None);

        let bytes = body.into_http_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[test]
    fn stream_is_claimed_once() {
        let chunks = stream::iter(vec![Ok(Bytes::from_static(b"x"))]);
        let shared = RequestBody::stream(chunks);
        let copy = shared.clone();

        assert!(shared.claim().is_ok());
        assert!(matches!(copy.claim(), Err(DescriptorError::BodyConsumed)));
    }

    #[test]
    fn in_memory_bodies_are_replayable() {
        let body = RequestBody::from(vec![1, 2, 3]);
        assert_eq!(body.size_hint(), Some(3));
        assert!(body.try_clone().is_some());
        assert!(body.claim().is_ok());
        assert!(body.claim().is_ok());
    }
}
