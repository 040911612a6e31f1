//! The response a session hands back.

use std::fmt;
use std::sync::{Mutex, OnceLock, PoisonError};

use bytes::{Bytes, BytesMut};
use http::response::Parts;
use http::{HeaderMap, StatusCode, Version};
use http_body_util::{BodyExt, Empty, Full};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::client::body::ResponseBody;
use crate::client::stat::{Collector, Milestone, Stat};
use crate::client::transport::RawResponse;
use crate::client::{Deadline, bounded};
use crate::error::Error;

/// A completed round trip.
///
/// The body is read on the first call to [`content`](Response::content) or
/// [`text`](Response::text) and cached; later calls return the cached bytes.
/// In stream mode the body was already delivered to the stream callback and
/// both methods return [`Error::BodyConsumed`].
///
/// The call's [`Stat`] is finalised, and the logging callback run, once the
/// body has been read, when the response is dropped unread, or when it is
/// turned back into the raw response with [`into_raw`](Response::into_raw).
pub struct Response {
    head: Parts,
    body: Mutex<Option<ResponseBody>>,
    content: OnceCell<Bytes>,
    collector: Mutex<Option<Collector>>,
    stat: OnceLock<Stat>,
    cancel: CancellationToken,
    deadline: Option<Deadline>,
}

impl Response {
    pub(crate) fn buffered(
        raw: RawResponse,
        collector: Collector,
        cancel: CancellationToken,
        deadline: Option<Deadline>,
    ) -> Self {
        let (head, body) = raw.into_parts();
        Self {
            head,
            body: Mutex::new(Some(body)),
            content: OnceCell::new(),
            collector: Mutex::new(Some(collector)),
            stat: OnceLock::new(),
            cancel,
            deadline,
        }
    }

    pub(crate) fn streamed(head: Parts, stat: Stat) -> Self {
        Self {
            head,
            body: Mutex::new(None),
            content: OnceCell::new(),
            collector: Mutex::new(None),
            stat: OnceLock::from(stat),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    /// The raw response head, extensions included.
    pub fn head(&self) -> &Parts {
        &self.head
    }

    /// The full body. Reads it on the first call, returns the cached bytes after.
    pub async fn content(&self) -> Result<Bytes, Error> {
        self.content.get_or_try_init(|| self.read_body()).await.cloned()
    }

    /// The body decoded as UTF-8, with invalid sequences replaced.
    pub async fn text(&self) -> Result<String, Error> {
        let bytes = self.content().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// The finalised Stat, once the call has completed. `None` while the
    /// body is still unread.
    pub fn stat(&self) -> Option<&Stat> {
        self.stat.get()
    }

    /// Gives up the wrapper and hands back the transport's response.
    ///
    /// The call completes here: its Stat is finalised and logged without
    /// counting whatever the caller reads from the returned body. A body that
    /// was already read comes back as the cached bytes; in stream mode it
    /// comes back empty.
    pub fn into_raw(mut self) -> RawResponse {
        let unread = self.body.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        let body = match (unread, self.content.get()) {
            (Some(body), _) => body,
            (None, Some(bytes)) => Full::new(bytes.clone()).map_err(|never| match never {}).boxed_unsync(),
            (None, None) => Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync(),
        };
        let placeholder = http::Response::new(()).into_parts().0;
        let head = std::mem::replace(&mut self.head, placeholder);
        // Drop finishes the collector.
        drop(self);
        RawResponse::from_parts(head, body)
    }

    async fn read_body(&self) -> Result<Bytes, Error> {
        let body = self
            .body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::BodyConsumed)?;

        let mut buf = BytesMut::new();
        let read = bounded(
            &self.cancel,
            self.deadline,
            pump(body, |chunk| {
                self.with_collector(|c| c.record_chunk(&chunk));
                buf.extend_from_slice(&chunk);
            }),
        )
        .await;

        match read {
            Ok(()) => {
                self.with_collector(|c| c.timeline().mark(Milestone::BodyRead));
                self.finish(None);
                Ok(buf.freeze())
            }
            Err(e) => {
                self.finish(Some(&e));
                Err(e)
            }
        }
    }

    fn with_collector(&self, f: impl FnOnce(&mut Collector)) {
        let mut collector = self.collector.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = collector.as_mut() {
            f(c);
        }
    }

    fn finish(&self, error: Option<&Error>) {
        let taken = self.collector.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(collector) = taken {
            let _ = self.stat.set(collector.finish(error));
        }
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        let collector = self.collector.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(collector) = collector.take() {
            collector.finish(None);
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.head.status)
            .field("version", &self.head.version)
            .field("headers", &self.head.headers)
            .finish_non_exhaustive()
    }
}

/// Feeds every data frame of `body` to `sink` until the body ends.
pub(crate) async fn pump(
    mut body: ResponseBody,
    mut sink: impl FnMut(Bytes) + Send,
) -> Result<(), Error> {
    while let Some(frame) = body.frame().await {
        if let Ok(data) = frame?.into_data() {
            sink(data);
        }
    }
    Ok(())
}
