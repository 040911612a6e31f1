//! # courier
//!
//! HTTP client sessions with composable round-trip interceptors and per-call
//! timing, plus a small server harness built on the same middleware idiom.
//!
//! ## The pieces
//!
//! - [`chain`]: the onion. An ordered stack of interceptors composed around
//!   one endpoint; the first registered runs first and finishes last. The
//!   client and the server both use it.
//! - [`client`]: a [`Session`] folds its default options and the call's own
//!   into a request descriptor, runs the descriptor's interceptors around the
//!   transport, and records a [`Stat`](client::Stat) for every call: request
//!   id, phase timings, status, bytes, error.
//! - [`server`]: a [`Router`] plus server-level middleware, with a panic
//!   boundary that turns a handler panic into a `500` and keeps serving.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use courier::client::{RequestOption, Session};
//! use courier::server::{Request, Router, Server, middleware};
//! use courier::Method;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn echo(req: Request) -> String {
//!     String::from_utf8_lossy(req.body()).into_owned()
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), courier::Error> {
//!     let shutdown = CancellationToken::new();
//!     let app = Router::new().on(Method::Post, "/echo", echo);
//!     let server = Server::bind("127.0.0.1:3000").with(middleware::Recover::new());
//!     tokio::spawn(server.run(app, shutdown.clone()));
//!
//!     let session = Session::builder()
//!         .option(RequestOption::url("http://127.0.0.1:3000"))
//!         .option(RequestOption::logger(|stat| println!("{} took {:?}", stat.url, stat.total)))
//!         .build();
//!     let res = session
//!         .do_request(&shutdown, [
//!             RequestOption::method(Method::Post),
//!             RequestOption::path("/echo"),
//!             RequestOption::body("abc"),
//!         ])
//!         .await?;
//!     assert_eq!(res.text().await?, "abc");
//!
//!     shutdown.cancel();
//!     Ok(())
//! }
//! ```
//!
//! ## What it leaves out
//!
//! The built-in transport speaks plain HTTP/1.1 over a fresh connection per
//! call. TLS, pooling and redirects belong to a custom
//! [`Transport`](client::Transport).

pub mod chain;
pub mod client;
mod error;
mod method;
pub mod server;

pub use client::Session;
pub use error::{BoxError, DescriptorError, Error, HandlerPanic};
pub use method::Method;
pub use server::{Router, Server};

/// Header carrying the request id between client and server.
pub const X_REQUEST_ID: http::HeaderName = http::HeaderName::from_static("x-request-id");
