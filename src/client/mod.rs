//! HTTP client sessions.
//!
//! A [`Session`] holds default [`RequestOption`]s and a [`Transport`]. Each
//! call to [`Session::do_request`] folds the call's options on top of the
//! defaults, runs the resulting request through the descriptor's interceptor
//! chain around the transport, and hands back a [`Response`] whose [`Stat`]
//! records how the call went.
//!
//! ```rust,no_run
//! use courier::client::{RequestOption, Session};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), courier::Error> {
//! let session = Session::builder()
//!     .option(RequestOption::url("http://example.test"))
//!     .option(RequestOption::logger(|stat| println!("{} {:?}", stat.url, stat.total)))
//!     .build();
//!
//! let cancel = CancellationToken::new();
//! let res = session
//!     .do_request(&cancel, [RequestOption::path("/echo"), RequestOption::body("abc")])
//!     .await?;
//! assert_eq!(res.text().await?, "abc");
//! # Ok(())
//! # }
//! ```

mod body;
mod descriptor;
mod interceptors;
mod response;
mod stat;
mod transport;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderValue, USER_AGENT};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::chain::Chain;
use crate::error::Error;

pub use body::{RequestBody, ResponseBody};
pub use descriptor::{
    DescriptorBuilder, RequestDescriptor, RequestMutator, RequestOption, RoundTripInterceptor,
    StreamCallback,
};
pub use interceptors::{RequestIdInterceptor, Retry};
pub use response::Response;
pub use stat::{
    DEFAULT_TRACE_CAP, Milestone, RequestId, Stat, StatLogger, Timeline, Timings, TraceConfig,
};
pub use transport::{HttpTransport, OutgoingRequest, Proxy, RawResponse, RoundTripResult, Transport};

use response::pump;
use stat::{Collector, response_head};
use transport::TransportEndpoint;

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Issues requests with shared defaults and a shared transport.
///
/// Cheap to clone; clones share the same defaults and transport. Calls never
/// modify the session, so one session can serve any number of concurrent
/// callers.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    defaults: DescriptorBuilder,
    transport: Arc<dyn Transport>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A session with no defaults over [`HttpTransport`].
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// The options every call starts from.
    pub fn defaults(&self) -> &DescriptorBuilder {
        &self.inner.defaults
    }

    /// Issues one request.
    ///
    /// `options` apply on top of the session defaults. The call is abandoned
    /// with [`Error::Canceled`] as soon as `cancel` fires, and with
    /// [`Error::Timeout`] once the configured timeout elapses; both bound the
    /// body read as well. Non-2xx statuses are returned as ordinary responses.
    pub async fn do_request(
        &self,
        cancel: &CancellationToken,
        options: impl IntoIterator<Item = RequestOption>,
    ) -> Result<Response, Error> {
        let descriptor = self.inner.defaults.clone().apply_all(options).build()?;
        self.execute(cancel, &descriptor).await
    }

    /// `GET` on `url`, on top of the session defaults.
    pub async fn get(&self, cancel: &CancellationToken, url: &str) -> Result<Response, Error> {
        self.do_request(cancel, [RequestOption::url(url)]).await
    }

    /// Runs an already-built descriptor.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        descriptor: &RequestDescriptor,
    ) -> Result<Response, Error> {
        // Claiming the body is the last validation step; a call that fails it
        // never starts and logs no Stat.
        let req = descriptor.to_request()?;
        let collector = Collector::start(
            descriptor.method(),
            descriptor.url().to_string(),
            descriptor.trace(),
            descriptor.logger().cloned(),
        );
        let span = tracing::info_span!(
            "request",
            request_id = %collector.request_id(),
            method = %descriptor.method(),
            url = %descriptor.url(),
        );
        self.run(cancel, descriptor, req, collector).instrument(span).await
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        descriptor: &RequestDescriptor,
        mut req: OutgoingRequest,
        mut collector: Collector,
    ) -> Result<Response, Error> {
        if cancel.is_cancelled() {
            return Err(fail(collector, Error::Canceled));
        }

        if !req.headers().contains_key(USER_AGENT) {
            req.headers_mut()
                .insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        }
        for mutate in descriptor.mutators() {
            mutate(&mut req);
        }
        let ext = req.extensions_mut();
        ext.insert(collector.timeline().clone());
        ext.insert(collector.trace());
        ext.insert(RequestId(collector.request_id().to_owned()));
        if let Some(proxy) = descriptor.proxy() {
            ext.insert(Proxy(proxy.clone()));
        }

        let chain: Chain<OutgoingRequest, RoundTripResult> =
            descriptor.interceptors().iter().cloned().collect();
        let endpoint = Arc::new(TransportEndpoint(Arc::clone(&self.inner.transport)));
        let composed = chain.compose(endpoint);

        let deadline = descriptor.timeout().map(Deadline::after);
        let raw = match bounded(cancel, deadline, composed.call(req)).await {
            Ok(raw) => raw,
            Err(e) => return Err(fail(collector, e)),
        };

        collector.record_status(raw.status());
        let trace = collector.trace();
        if trace.captures_heads() {
            collector.timeline().capture_response(&response_head(&raw), trace.cap);
        }

        let Some(on_chunk) = descriptor.stream_callback() else {
            return Ok(Response::buffered(raw, collector, cancel.clone(), deadline));
        };

        let (head, body) = raw.into_parts();
        let drained = bounded(
            cancel,
            deadline,
            pump(body, |chunk| {
                collector.record_chunk(&chunk);
                on_chunk(chunk);
            }),
        )
        .await;
        match drained {
            Ok(()) => {
                collector.timeline().mark(Milestone::BodyRead);
                Ok(Response::streamed(head, collector.finish(None)))
            }
            Err(e) => Err(fail(collector, e)),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("defaults", &self.inner.defaults)
            .finish_non_exhaustive()
    }
}

fn fail(collector: Collector, error: Error) -> Error {
    collector.finish(Some(&error));
    error
}

/// Builds a [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    defaults: DescriptorBuilder,
    transport: Option<Arc<dyn Transport>>,
}

impl SessionBuilder {
    /// Adds a default option. Defaults apply before every call's own options.
    pub fn option(mut self, option: RequestOption) -> Self {
        self.defaults = self.defaults.apply(option);
        self
    }

    pub fn options(mut self, options: impl IntoIterator<Item = RequestOption>) -> Self {
        self.defaults = self.defaults.apply_all(options);
        self
    }

    /// Replaces the default [`HttpTransport`].
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn build(self) -> Session {
        let transport = self.transport.unwrap_or_else(|| Arc::new(HttpTransport::new()));
        Session {
            inner: Arc::new(SessionInner { defaults: self.defaults, transport }),
        }
    }
}

// ── Call bounds ───────────────────────────────────────────────────────────────

/// When a call's timeout runs out.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    fn after(limit: Duration) -> Self {
        Self { at: Instant::now() + limit, limit }
    }
}

/// Runs `fut` until it finishes, `cancel` fires, or `deadline` passes.
/// Dropping `fut` on the way out aborts whatever I/O it had in flight.
pub(crate) async fn bounded<T>(
    cancel: &CancellationToken,
    deadline: Option<Deadline>,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    let timed = async {
        match deadline {
            Some(d) => tokio::time::timeout_at(d.at, fut)
                .await
                .unwrap_or(Err(Error::Timeout(d.limit))),
            None => fut.await,
        }
    };
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Canceled),
        res = timed => res,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};

    use super::*;
    use crate::chain::{BoxFuture, Next, from_fn};

    /// Answers every request with its own body, counting calls.
    #[derive(Clone, Default)]
    struct Echo {
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<http::HeaderMap>>>,
    }

    impl Transport for Echo {
        fn round_trip(&self, req: OutgoingRequest) -> BoxFuture<'_, RoundTripResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(req.headers().clone());
            let body = req.body().as_bytes().cloned().unwrap_or_default();
            Box::pin(async move {
                let body: ResponseBody = Full::new(body).map_err(|never| match never {}).boxed_unsync();
                Ok(http::Response::new(body))
            })
        }
    }

    /// Never answers.
    struct Stall;

    impl Transport for Stall {
        fn round_trip(&self, _req: OutgoingRequest) -> BoxFuture<'_, RoundTripResult> {
            Box::pin(std::future::pending())
        }
    }

    fn session(transport: impl Transport) -> Session {
        Session::builder()
            .option(RequestOption::url("http://example.test"))
            .transport(transport)
            .build()
    }

    #[tokio::test]
    async fn canceled_token_never_reaches_transport() {
        let echo = Echo::default();
        let stats = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&stats);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = session(echo.clone())
            .do_request(&cancel, [RequestOption::logger(move |s: &Stat| {
                sink.lock().unwrap().push(s.clone())
            })])
            .await
            .unwrap_err();

        assert!(err.is_canceled());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
        let stats = stats.lock().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].error.as_deref(), Some("request canceled"));
    }

    #[tokio::test]
    async fn invalid_descriptor_produces_no_stat() {
        let logged = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&logged);
        let err = Session::builder()
            .transport(Echo::default())
            .build()
            .do_request(&CancellationToken::new(), [RequestOption::logger(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })])
            .await
            .unwrap_err();

        assert!(err.is_descriptor());
        assert_eq!(logged.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn spent_stream_body_fails_before_the_call_starts() {
        let logged = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&logged);
        let echo = Echo::default();
        let body = futures_util::stream::iter([Ok(Bytes::from_static(b"once"))]);
        let s = Session::builder()
            .option(RequestOption::url("http://example.test"))
            .option(RequestOption::body(RequestBody::stream(body)))
            .option(RequestOption::logger(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .transport(echo.clone())
            .build();

        drop(s.do_request(&CancellationToken::new(), []).await.unwrap());
        let err = s.do_request(&CancellationToken::new(), []).await.unwrap_err();

        assert!(err.is_descriptor());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
        assert_eq!(logged.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_is_distinct_from_transport_failure() {
        let err = session(Stall)
            .do_request(&CancellationToken::new(), [RequestOption::timeout(Duration::from_millis(20))])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(20)));
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_call() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = session(Stall).do_request(&cancel, []).await.unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn defaults_and_mutators_shape_the_request() {
        let echo = Echo::default();
        let s = Session::builder()
            .option(RequestOption::url("http://example.test"))
            .option(RequestOption::header("x-team", "core"))
            .transport(echo.clone())
            .build();

        s.do_request(&CancellationToken::new(), [RequestOption::mutator(|req: &mut OutgoingRequest| {
            req.headers_mut().insert("x-mutated", HeaderValue::from_static("yes"));
        })])
        .await
        .unwrap();

        let seen = echo.seen.lock().unwrap();
        assert_eq!(seen[0]["x-team"], "core");
        assert_eq!(seen[0]["x-mutated"], "yes");
        assert_eq!(seen[0][USER_AGENT], DEFAULT_USER_AGENT);
        assert!(s.defaults().clone().build().is_ok());
    }

    #[tokio::test]
    async fn interceptor_can_short_circuit() {
        let echo = Echo::default();
        let canned = from_fn(|_req: OutgoingRequest, _next: Next<OutgoingRequest, RoundTripResult>| async {
            let body: ResponseBody = Full::new(Bytes::from_static(b"cached"))
                .map_err(|never| match never {})
                .boxed_unsync();
            Ok::<_, Error>(http::Response::new(body))
        });

        let res = session(echo.clone())
            .do_request(&CancellationToken::new(), [RequestOption::interceptor(canned)])
            .await
            .unwrap();

        assert_eq!(res.text().await.unwrap(), "cached");
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stream_mode_delivers_chunks_and_finalises() {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&chunks);
        let res = session(Echo::default())
            .do_request(&CancellationToken::new(), [
                RequestOption::body("streamed"),
                RequestOption::stream(move |chunk| sink.lock().unwrap().push(chunk)),
            ])
            .await
            .unwrap();

        assert_eq!(chunks.lock().unwrap().concat(), b"streamed");
        assert!(matches!(res.content().await, Err(Error::BodyConsumed)));
        let stat = res.stat().unwrap();
        assert_eq!(stat.bytes_read, 8);
        assert!(stat.is_success());
    }
}
