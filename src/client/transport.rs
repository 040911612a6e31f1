//! The base round trip every client chain ends in.
//!
//! A [`Transport`] performs exactly one request/response exchange. It does not
//! follow redirects, retry, or time out on its own: those are interceptor and
//! session concerns. Per-call context reaches it through the request's
//! extensions:
//!
//! - [`Timeline`]: stamp lifecycle milestones as they happen.
//! - [`Proxy`]: send the request through this HTTP proxy.
//!
//! [`HttpTransport`] is the built-in implementation: plain HTTP/1.1 over a
//! fresh tokio TCP connection per call, driven by hyper's client connection
//! API. TLS is left to other `Transport` implementations.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::header::{HOST, HeaderValue};
use http::uri::{PathAndQuery, Scheme};
use http::Uri;
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::chain::{BoxFuture, Endpoint};
use crate::client::body::{RequestBody, ResponseBody};
use crate::client::stat::{Milestone, Timeline, TraceConfig, request_head};
use crate::error::Error;

/// The request type client interceptors see.
pub type OutgoingRequest = http::Request<RequestBody>;

/// What a transport hands back.
pub type RawResponse = http::Response<ResponseBody>;

/// The output of one trip through the client chain.
pub type RoundTripResult = Result<RawResponse, Error>;

/// Performs one request/response exchange.
///
/// Implementations are shared by every call on a session and must tolerate
/// concurrent use.
pub trait Transport: Send + Sync + 'static {
    fn round_trip(&self, req: OutgoingRequest) -> BoxFuture<'_, RoundTripResult>;
}

/// Request extension: route this request through an HTTP proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proxy(pub Uri);

// ── HttpTransport ─────────────────────────────────────────────────────────────

/// Plain HTTP/1.1 over tokio TCP, one connection per round trip.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    nodelay: bool,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `TCP_NODELAY` on new connections. On by default.
    pub fn nodelay(mut self, on: bool) -> Self {
        self.nodelay = on;
        self
    }

    async fn send(&self, mut req: OutgoingRequest) -> RoundTripResult {
        let timeline = req.extensions().get::<Timeline>().cloned().unwrap_or_default();
        let proxy = req.extensions().get::<Proxy>().map(|p| p.0.clone());

        if req.uri().scheme() == Some(&Scheme::HTTPS) {
            return Err(Error::transport("https requires a TLS-capable transport"));
        }

        let dial = proxy.as_ref().unwrap_or(req.uri());
        let (host, port) = host_port(dial)?;

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(Error::transport)?
            .collect();
        timeline.mark(Milestone::DnsResolved);

        let stream = connect(&addrs).await?;
        stream.set_nodelay(self.nodelay)?;
        timeline.mark(Milestone::Connected);

        let io = TokioIo::new(Recorded::new(stream, timeline));
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(Error::transport)?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(%host, "connection closed: {e}");
            }
        });

        prepare_target(&mut req, proxy.is_some())?;
        let req = req.map(RequestBody::into_http_body);
        let res = sender.send_request(req).await.map_err(Error::transport)?;
        Ok(res.map(|body| body.map_err(Error::transport).boxed_unsync()))
    }
}

impl Transport for HttpTransport {
    fn round_trip(&self, req: OutgoingRequest) -> BoxFuture<'_, RoundTripResult> {
        Box::pin(self.send(req))
    }
}

fn host_port(uri: &Uri) -> Result<(String, u16), Error> {
    let host = uri
        .host()
        .ok_or_else(|| Error::transport(format!("no host in `{uri}`")))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_owned();
    let port = uri.port_u16().unwrap_or(80);
    Ok((host, port))
}

async fn connect(addrs: &[SocketAddr]) -> Result<TcpStream, Error> {
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, "connect failed: {e}");
                last = Some(e);
            }
        }
    }
    Err(match last {
        Some(e) => Error::transport(e),
        None => Error::transport("host resolved to no addresses"),
    })
}

/// Sets `Host`, and rewrites the URI to origin-form unless a proxy needs the
/// absolute form.
fn prepare_target(req: &mut OutgoingRequest, via_proxy: bool) -> Result<(), Error> {
    if !req.headers().contains_key(HOST) {
        if let Some(authority) = req.uri().authority() {
            let value = HeaderValue::from_str(authority.as_str()).map_err(Error::transport)?;
            req.headers_mut().insert(HOST, value);
        }
    }
    if !via_proxy {
        let origin = req
            .uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        *req.uri_mut() = Uri::from(origin);
    }
    Ok(())
}

// ── Milestone-recording IO ────────────────────────────────────────────────────

/// Stamps `RequestWritten` on every write until the response starts, and
/// `FirstByte` on the first read that yields data.
struct Recorded<T> {
    inner: T,
    timeline: Timeline,
    responded: bool,
}

impl<T> Recorded<T> {
    fn new(inner: T, timeline: Timeline) -> Self {
        Self { inner, timeline, responded: false }
    }

    fn wrote(&self, polled: &Poll<io::Result<usize>>) {
        if !self.responded && matches!(polled, Poll::Ready(Ok(n)) if *n > 0) {
            self.timeline.mark(Milestone::RequestWritten);
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Recorded<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        if !self.responded && buf.filled().len() > before {
            self.responded = true;
            self.timeline.mark(Milestone::FirstByte);
        }
        polled
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Recorded<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let polled = Pin::new(&mut self.inner).poll_write(cx, data);
        self.wrote(&polled);
        polled
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let polled = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        self.wrote(&polled);
        polled
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

// ── Chain endpoint ────────────────────────────────────────────────────────────

/// Adapts a [`Transport`] into the innermost link of the client chain, taking
/// the request trace capture on the way so it reflects every interceptor's
/// edits.
pub(crate) struct TransportEndpoint(pub(crate) Arc<dyn Transport>);

impl Endpoint<OutgoingRequest, RoundTripResult> for TransportEndpoint {
    fn call(&self, req: OutgoingRequest) -> BoxFuture<'_, RoundTripResult> {
        let ext = req.extensions();
        if let (Some(timeline), Some(trace)) = (ext.get::<Timeline>(), ext.get::<TraceConfig>()) {
            if trace.captures_heads() {
                timeline.capture_request(&request_head(&req), trace.cap);
            }
            if trace.captures_bodies() {
                if let Some(body) = req.body().as_bytes() {
                    timeline.capture_request(body, trace.cap);
                }
            }
        }
        self.0.round_trip(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_form_without_proxy() {
        let mut req = http::Request::builder()
            .uri("http://example.test:8080/echo?x=1")
            .body(RequestBody::Empty)
            .unwrap();
        prepare_target(&mut req, false).unwrap();

        assert_eq!(req.uri().to_string(), "/echo?x=1");
        assert_eq!(req.headers()[HOST], "example.test:8080");
    }

    #[test]
    fn absolute_form_through_proxy() {
        let mut req = http::Request::builder()
            .uri("http://example.test/a")
            .header(HOST, "override.test")
            .body(RequestBody::Empty)
            .unwrap();
        prepare_target(&mut req, true).unwrap();

        assert_eq!(req.uri().to_string(), "http://example.test/a");
        assert_eq!(req.headers()[HOST], "override.test");
    }

    #[test]
    fn host_port_defaults_to_80() {
        let uri: Uri = "http://[::1]/x".parse().unwrap();
        assert_eq!(host_port(&uri).unwrap(), ("::1".to_owned(), 80));
        let uri: Uri = "http://proxy.test:3128".parse().unwrap();
        assert_eq!(host_port(&uri).unwrap(), ("proxy.test".to_owned(), 3128));
    }

    #[tokio::test]
    async fn https_is_refused_without_touching_the_network() {
        let req = http::Request::builder()
            .uri("https://example.test/")
            .body(RequestBody::Empty)
            .unwrap();
        let err = HttpTransport::new().round_trip(req).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn connection_refused_is_a_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let timeline = Timeline::default();
        let mut req = http::Request::builder()
            .uri(format!("http://{addr}/"))
            .body(RequestBody::Empty)
            .unwrap();
        req.extensions_mut().insert(timeline.clone());

        let err = HttpTransport::new().round_trip(req).await.unwrap_err();
        assert!(err.is_transport());
        assert!(timeline.get(Milestone::DnsResolved).is_some());
        assert!(timeline.get(Milestone::Connected).is_none());
    }
}
