//! Built-in server middleware.
//!
//! Middleware intercepts requests and responses and is the right place for
//! cross-cutting concerns. Any [`Interceptor<Request, Response>`] is
//! middleware; [`from_fn`](crate::chain::from_fn) turns an async closure into
//! one. Register server-wide middleware with
//! [`Server::with`](crate::server::Server::with) and per-route middleware with
//! [`Route::with`](crate::server::Route::with).
//!
//! - [`Recover`]: turns a handler panic into a `500` and reports it.
//! - [`RequestId`]: adopts or assigns an `x-request-id` and echoes it back.
//! - [`Trace`]: one `info` line per request with method, path, status, latency.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use http::header::HeaderValue;
use tracing::{Instrument, error, info, info_span};

use crate::X_REQUEST_ID;
use crate::chain::{BoxFuture, Interceptor, Next};
use crate::error::{Error, HandlerPanic};
use crate::server::request::{AssignedId, Request};
use crate::server::response::Response;

/// Runs `fut`, answering `500` if it panics.
pub(crate) async fn catch_panic(
    fut: impl std::future::Future<Output = Response>,
    method: crate::Method,
    path: &str,
) -> Result<Response, HandlerPanic> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(res) => Ok(res),
        Err(payload) => {
            let panic = HandlerPanic::from_payload(payload);
            error!(%method, path, "{panic}");
            Err(panic)
        }
    }
}

// ── Recover ───────────────────────────────────────────────────────────────────

/// Panic boundary.
///
/// A panic anywhere inside this layer becomes a `500 Internal Server Error`
/// whose extensions hold the [`HandlerPanic`]. The server already recovers
/// panics at its outermost layer; registering `Recover` explicitly lets outer
/// middleware see the `500` and lets you report the panic with
/// [`on_panic`](Recover::on_panic).
#[derive(Clone, Default)]
pub struct Recover {
    on_panic: Option<Arc<dyn Fn(&Error) + Send + Sync>>,
}

impl Recover {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with [`Error::HandlerPanic`] for every recovered panic.
    pub fn on_panic(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_panic = Some(Arc::new(f));
        self
    }
}

impl Interceptor<Request, Response> for Recover {
    fn handle(&self, req: Request, next: Next<Request, Response>) -> BoxFuture<'_, Response> {
        let method = req.method();
        let path = req.path().to_owned();
        Box::pin(async move {
            match catch_panic(next.run(req), method, &path).await {
                Ok(res) => res,
                Err(panic) => {
                    if let Some(report) = &self.on_panic {
                        report(&Error::HandlerPanic(panic.clone()));
                    }
                    Response::from_panic(panic)
                }
            }
        })
    }
}

// ── RequestId ─────────────────────────────────────────────────────────────────

/// Gives every request an id.
///
/// Adopts the inbound `x-request-id` header when present, otherwise generates
/// a UUID. Handlers read it with [`Request::request_id`]; the response carries
/// it back in `x-request-id`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestId;

impl Interceptor<Request, Response> for RequestId {
    fn handle(&self, mut req: Request, next: Next<Request, Response>) -> BoxFuture<'_, Response> {
        let id = match req.header(X_REQUEST_ID.as_str()) {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        req.extensions_mut().insert(AssignedId(id.clone()));
        Box::pin(async move {
            let mut res = next.run(req).await;
            if let Ok(value) = HeaderValue::from_str(&id) {
                res.headers_mut().entry(X_REQUEST_ID).or_insert(value);
            }
            res
        })
    }
}

// ── Trace ─────────────────────────────────────────────────────────────────────

/// Logs one line per request and runs the rest of the chain inside a
/// `request` span.
#[derive(Clone, Copy, Debug, Default)]
pub struct Trace;

impl Interceptor<Request, Response> for Trace {
    fn handle(&self, req: Request, next: Next<Request, Response>) -> BoxFuture<'_, Response> {
        let method = req.method();
        let path = req.path().to_owned();
        let span = info_span!("request", %method, path = %path, request_id = req.request_id());
        let started = Instant::now();
        Box::pin(
            async move {
                let res = next.run(req).await;
                info!(
                    %method,
                    path = %path,
                    status = res.status_code().as_u16(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "handled"
                );
                res
            }
            .instrument(span),
        )
    }
}
