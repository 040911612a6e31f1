//! HTTP server and graceful shutdown.
//!
//! A [`Server`] owns the server-level middleware; a [`Router`] owns the
//! routes and their route-level middleware. [`Server::run`] composes the two
//! once, at startup:
//!
//! ```text
//! panic boundary → server middleware… → route match → route middleware… → handler
//! ```
//!
//! Unmatched paths still pass through the server-level middleware and come out
//! as `404`. Methods outside [`Method`] are answered `405` before anything runs,
//! and bodies over the [`body_limit`](Server::body_limit) get `413`.
//!
//! # Shutdown
//!
//! `run` and `serve` take a [`CancellationToken`]. When it fires the server:
//! 1. Stops accepting new connections.
//! 2. Asks every open connection to finish its in-flight request and close.
//! 3. Returns once all connections are gone.
//!
//! Wiring the token to SIGTERM or Ctrl-C is up to the binary.

mod handler;
pub mod middleware;
mod request;
mod response;
mod router;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::chain::{Chain, Composed, Interceptor};
use crate::error::Error;
use crate::method::Method;

pub use handler::Handler;
pub use request::Request;
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::{Route, Router};

/// Default cap on a buffered request body: 2 MiB.
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// The HTTP server.
pub struct Server {
    addr: String,
    middleware: Chain<Request, Response>,
    body_limit: usize,
}

impl Server {
    /// Configures the server to bind to `addr` when [`run`](Server::run) is
    /// called. The address is resolved then, and a bad one is reported as
    /// [`Error::Io`].
    ///
    /// ```rust
    /// use courier::server::{Server, middleware};
    ///
    /// let server = Server::bind("0.0.0.0:3000")
    ///     .with(middleware::Trace)
    ///     .with(middleware::Recover::new());
    /// ```
    pub fn bind(addr: impl Into<String>) -> Self {
        Self { addr: addr.into(), middleware: Chain::new(), body_limit: DEFAULT_BODY_LIMIT }
    }

    /// Largest request body, in bytes, the server will buffer. Larger ones
    /// are answered `413 Payload Too Large` without reaching any middleware.
    pub fn body_limit(mut self, bytes: usize) -> Self {
        self.body_limit = bytes;
        self
    }

    /// Appends a server-level middleware. The first one registered is the
    /// outermost.
    pub fn with(mut self, middleware: impl Interceptor<Request, Response>) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Binds, then serves `router` until `cancel` fires and every connection
    /// has drained.
    pub async fn run(self, router: Router, cancel: CancellationToken) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr.as_str()).await?;
        self.serve(listener, router, cancel).await
    }

    /// Like [`run`](Server::run), on a listener the caller already bound.
    pub async fn serve(
        self,
        listener: TcpListener,
        router: Router,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        let app = Arc::new(App::new(self.middleware, router).body_limit(self.body_limit));
        let addr = listener.local_addr()?;

        info!(%addr, "courier listening");

        let mut tasks = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                // Check shutdown first so a cancel stops accepting immediately,
                // even if more connections are queued.
                biased;

                () = cancel.cancelled() => {
                    info!(in_flight = tasks.len(), "shutdown requested, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    tasks.spawn(serve_connection(Arc::clone(&app), stream, remote_addr, cancel.clone()));
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drop(listener);
        while tasks.join_next().await.is_some() {}

        info!(%addr, "courier stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("middleware", &self.middleware.len())
            .field("body_limit", &self.body_limit)
            .finish()
    }
}

async fn serve_connection(
    app: Arc<App>,
    stream: TcpStream,
    remote_addr: SocketAddr,
    cancel: CancellationToken,
) {
    // `service_fn` is called once per request on the connection.
    let svc = service_fn(move |req| {
        let app = Arc::clone(&app);
        async move { app.dispatch(req, remote_addr).await }
    });

    // `auto::Builder` handles both HTTP/1.1 and HTTP/2, whatever the client speaks.
    let builder = ConnBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), svc);
    tokio::pin!(conn);

    let mut draining = false;
    let res = loop {
        tokio::select! {
            res = conn.as_mut() => break res,
            () = cancel.cancelled(), if !draining => {
                conn.as_mut().graceful_shutdown();
                draining = true;
            }
        }
    };
    if let Err(e) = res {
        error!(peer = %remote_addr, "connection error: {e}");
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Everything a connection needs to answer requests: the composed stack.
struct App {
    stack: Composed<Request, Response>,
    body_limit: usize,
}

impl App {
    fn new(middleware: Chain<Request, Response>, router: Router) -> Self {
        Self { stack: middleware.compose(Arc::new(router)), body_limit: DEFAULT_BODY_LIMIT }
    }

    fn body_limit(mut self, bytes: usize) -> Self {
        self.body_limit = bytes;
        self
    }

    /// Runs one request through the stack, recovering any panic that escapes it.
    async fn handle(&self, req: Request) -> Response {
        let method = req.method();
        let path = req.path().to_owned();
        match middleware::catch_panic(self.stack.call(req), method, &path).await {
            Ok(res) => res,
            Err(panic) => Response::from_panic(panic),
        }
    }

    /// Core hot path. Every failure becomes a response, so hyper never sees an
    /// error.
    async fn dispatch(
        &self,
        req: hyper::Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<http::Response<Full<Bytes>>, Infallible> {
        let Ok(method) = Method::try_from(req.method()) else {
            return Ok(Response::status(StatusCode::METHOD_NOT_ALLOWED).into_hyper());
        };
        let (head, body) = req.into_parts();
        let body = match Limited::new(body, self.body_limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                debug!(peer = %remote_addr, limit = self.body_limit, "request body too large");
                return Ok(Response::status(StatusCode::PAYLOAD_TOO_LARGE).into_hyper());
            }
            Err(e) => {
                debug!(peer = %remote_addr, "failed to read request body: {e}");
                return Ok(Response::status(StatusCode::BAD_REQUEST).into_hyper());
            }
        };

        let res = self.handle(Request::new(method, head, body, Some(remote_addr))).await;
        Ok(res.into_hyper())
    }
}
