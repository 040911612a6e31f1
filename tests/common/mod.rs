//! Shared utilities for the integration suites.

#![allow(dead_code)]

use std::time::Duration;

use courier::server::{ContentType, Request, Response, Route, Router, Server, middleware};
use courier::{Error, Method};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A courier server on an ephemeral localhost port.
pub struct TestServer {
    pub url: String,
    pub shutdown: CancellationToken,
    handle: JoinHandle<Result<(), Error>>,
}

impl TestServer {
    /// Cancels the server and waits for it to drain.
    pub async fn stop(self) -> Result<(), Error> {
        self.shutdown.cancel();
        self.handle.await.expect("server task panicked")
    }
}

/// Installs a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Starts `server` with `router`. The listener is bound before this returns,
/// so requests can be sent immediately.
pub async fn start(server: Server, router: Router) -> TestServer {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.serve(listener, router, shutdown.clone()));
    TestServer { url: format!("http://{addr}"), shutdown, handle }
}

/// Starts the standard app behind `Recover` and `RequestId`.
pub async fn start_app() -> TestServer {
    let server = Server::bind("127.0.0.1:0")
        .with(middleware::Recover::new())
        .with(middleware::RequestId);
    start(server, app()).await
}

/// Routes used across the suites.
pub fn app() -> Router {
    Router::new()
        .on(Method::Get, "/echo", echo)
        .on(Method::Post, "/echo", echo)
        .on(Method::Get, "/slow", slow)
        .on(Method::Get, "/boom", boom)
        .on(Method::Get, "/id", request_id)
        .route(Method::Get, "/traced", Route::new(echo).with(middleware::Trace))
}

/// Answers with the request body.
pub async fn echo(req: Request) -> Response {
    Response::builder().bytes(ContentType::OctetStream, req.body().clone())
}

pub async fn slow(_req: Request) -> &'static str {
    tokio::time::sleep(Duration::from_millis(300)).await;
    "finally"
}

pub async fn boom(_req: Request) -> Response {
    panic!("handler exploded")
}

pub async fn request_id(req: Request) -> String {
    req.request_id().unwrap_or("none").to_owned()
}
