//! Incoming HTTP request type.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use http::request::Parts;
use http::{Extensions, HeaderMap, Uri};

use crate::method::Method;

/// An incoming HTTP request, body already read.
pub struct Request {
    method: Method,
    head: Parts,
    body: Bytes,
    params: HashMap<String, String>,
    remote_addr: Option<SocketAddr>,
}

/// Request extension set by [`RequestId`](crate::server::middleware::RequestId).
#[derive(Clone, Debug)]
pub(crate) struct AssignedId(pub(crate) String);

impl Request {
    pub(crate) fn new(method: Method, head: Parts, body: Bytes, remote_addr: Option<SocketAddr>) -> Self {
        Self { method, head, body, params: HashMap::new(), remote_addr }
    }

    pub fn method(&self) -> Method { self.method }
    pub fn uri(&self) -> &Uri { &self.head.uri }
    pub fn path(&self) -> &str { self.head.uri.path() }
    pub fn query(&self) -> Option<&str> { self.head.uri.query() }
    pub fn headers(&self) -> &HeaderMap { &self.head.headers }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.head.headers }
    pub fn body(&self) -> &Bytes { &self.body }
    pub fn extensions(&self) -> &Extensions { &self.head.extensions }
    pub fn extensions_mut(&mut self) -> &mut Extensions { &mut self.head.extensions }

    /// Peer address, when the request came off a socket.
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// Header value as a string. `None` if absent or not visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The id assigned by the request-id middleware, if it ran.
    pub fn request_id(&self) -> Option<&str> {
        self.head.extensions.get::<AssignedId>().map(|id| id.0.as_str())
    }

    pub(crate) fn set_params(&mut self, params: HashMap<String, String>) {
        self.params = params;
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.head.uri)
            .field("headers", &self.head.headers)
            .field("body_len", &self.body.len())
            .field("params", &self.params)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_request(method: Method, uri: &str, body: &'static str) -> Request {
    let (head, ()) = http::Request::builder()
        .method(http::Method::from(method))
        .uri(uri)
        .body(())
        .unwrap()
        .into_parts();
    Request::new(method, head, Bytes::from_static(body.as_bytes()), None)
}
