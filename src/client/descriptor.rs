//! Request options and the descriptor they fold into.
//!
//! Options apply left to right onto a [`DescriptorBuilder`]. Scalar settings
//! (URL, method, body, proxy, timeout, trace, logger, stream callback) are
//! overwritten by later options; collections (path segments, query pairs,
//! headers added with [`RequestOption::Header`], interceptors, mutators) are
//! appended. [`DescriptorBuilder::build`] validates the result into an
//! immutable [`RequestDescriptor`].
//!
//! ```rust
//! use std::time::Duration;
//! use courier::client::{DescriptorBuilder, RequestOption};
//!
//! let descriptor = DescriptorBuilder::default()
//!     .apply_all([
//!         RequestOption::url("http://example.test/api"),
//!         RequestOption::path("/users"),
//!         RequestOption::timeout(Duration::from_secs(1)),
//!         RequestOption::timeout(Duration::from_secs(5)),
//!     ])
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(descriptor.url().as_str(), "http://example.test/api/users");
//! assert_eq!(descriptor.timeout(), Some(Duration::from_secs(5)));
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Uri;
use url::Url;

use crate::chain::Interceptor;
use crate::client::body::RequestBody;
use crate::client::stat::{StatLogger, TraceConfig};
use crate::client::transport::{OutgoingRequest, RoundTripResult};
use crate::error::DescriptorError;
use crate::method::Method;

/// A client interceptor, shared between descriptors.
pub type RoundTripInterceptor = Arc<dyn Interceptor<OutgoingRequest, RoundTripResult>>;

/// Edits the outgoing request after it is assembled, before the chain runs.
pub type RequestMutator = Arc<dyn Fn(&mut OutgoingRequest) + Send + Sync>;

/// Receives each response body chunk in stream mode.
pub type StreamCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// One configuration step.
#[derive(Clone)]
pub enum RequestOption {
    Url(String),
    /// Appended to the base URL. Repeated options append in order.
    Path(String),
    /// Appended as a URL-encoded query pair.
    Query(String, String),
    Method(Method),
    Body(RequestBody),
    /// Adds a header value, keeping values already set for the name.
    Header(String, String),
    /// Replaces every value already set for the name.
    SetHeader(String, String),
    Proxy(String),
    /// `Duration::ZERO` means no timeout.
    Timeout(Duration),
    Trace(TraceConfig),
    Interceptor(RoundTripInterceptor),
    Mutator(RequestMutator),
    Logger(StatLogger),
    /// Deliver the response body chunk by chunk instead of buffering it.
    Stream(StreamCallback),
}

impl RequestOption {
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url(url.into())
    }

    pub fn path(path: impl Into<String>) -> Self {
        Self::Path(path.into())
    }

    pub fn query(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Query(key.into(), value.into())
    }

    pub fn method(method: Method) -> Self {
        Self::Method(method)
    }

    pub fn body(body: impl Into<RequestBody>) -> Self {
        Self::Body(body.into())
    }

    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Header(name.into(), value.into())
    }

    pub fn set_header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::SetHeader(name.into(), value.into())
    }

    pub fn proxy(url: impl Into<String>) -> Self {
        Self::Proxy(url.into())
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout(timeout)
    }

    /// Trace level 0 (off), 1 (heads) or 2 (heads and bodies), capped at `cap`
    /// bytes per direction.
    pub fn trace(level: u8, cap: usize) -> Self {
        Self::Trace(TraceConfig { level, cap })
    }

    pub fn interceptor(i: impl Interceptor<OutgoingRequest, RoundTripResult>) -> Self {
        Self::Interceptor(Arc::new(i))
    }

    pub fn mutator(f: impl Fn(&mut OutgoingRequest) + Send + Sync + 'static) -> Self {
        Self::Mutator(Arc::new(f))
    }

    pub fn logger(f: impl Fn(&crate::client::Stat) + Send + Sync + 'static) -> Self {
        Self::Logger(Arc::new(f))
    }

    pub fn stream(f: impl Fn(Bytes) + Send + Sync + 'static) -> Self {
        Self::Stream(Arc::new(f))
    }

    /// Applies this option to `builder`.
    pub fn apply(self, builder: &mut DescriptorBuilder) {
        match self {
            Self::Url(url) => builder.base_url = Some(url),
            Self::Path(path) => builder.paths.push(path),
            Self::Query(k, v) => builder.query.push((k, v)),
            Self::Method(m) => builder.method = m,
            Self::Body(b) => builder.body = b,
            Self::Header(name, value) => builder.header(&name, &value, false),
            Self::SetHeader(name, value) => builder.header(&name, &value, true),
            Self::Proxy(url) => builder.proxy = Some(url),
            Self::Timeout(t) => builder.timeout = t,
            Self::Trace(t) => builder.trace = t,
            Self::Interceptor(i) => builder.interceptors.push(i),
            Self::Mutator(m) => builder.mutators.push(m),
            Self::Logger(l) => builder.logger = Some(l),
            Self::Stream(s) => builder.stream = Some(s),
        }
    }
}

impl fmt::Debug for RequestOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(u) => f.debug_tuple("Url").field(u).finish(),
            Self::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Self::Query(k, v) => f.debug_tuple("Query").field(k).field(v).finish(),
            Self::Method(m) => f.debug_tuple("Method").field(m).finish(),
            Self::Body(b) => f.debug_tuple("Body").field(b).finish(),
            Self::Header(n, v) => f.debug_tuple("Header").field(n).field(v).finish(),
            Self::SetHeader(n, v) => f.debug_tuple("SetHeader").field(n).field(v).finish(),
            Self::Proxy(p) => f.debug_tuple("Proxy").field(p).finish(),
            Self::Timeout(t) => f.debug_tuple("Timeout").field(t).finish(),
            Self::Trace(t) => f.debug_tuple("Trace").field(t).finish(),
            Self::Interceptor(_) => f.write_str("Interceptor(..)"),
            Self::Mutator(_) => f.write_str("Mutator(..)"),
            Self::Logger(_) => f.write_str("Logger(..)"),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

// ── DescriptorBuilder ─────────────────────────────────────────────────────────

/// A descriptor under construction. The zero value is a bare `GET` with no URL.
#[derive(Clone, Default)]
pub struct DescriptorBuilder {
    base_url: Option<String>,
    paths: Vec<String>,
    query: Vec<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: RequestBody,
    proxy: Option<String>,
    timeout: Duration,
    trace: TraceConfig,
    interceptors: Vec<RoundTripInterceptor>,
    mutators: Vec<RequestMutator>,
    logger: Option<StatLogger>,
    stream: Option<StreamCallback>,
    // First invalid header seen; reported by `build`.
    error: Option<String>,
}

impl DescriptorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one option. Returns `self` for chaining.
    pub fn apply(mut self, option: RequestOption) -> Self {
        option.apply(&mut self);
        self
    }

    /// Applies options in order.
    pub fn apply_all(mut self, options: impl IntoIterator<Item = RequestOption>) -> Self {
        for option in options {
            option.apply(&mut self);
        }
        self
    }

    fn header(&mut self, name: &str, value: &str, replace: bool) {
        let parsed = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| format!("name `{name}`"))
            .and_then(|n| {
                HeaderValue::from_str(value)
                    .map(|v| (n, v))
                    .map_err(|_| format!("value for `{name}`"))
            });
        match parsed {
            Ok((name, value)) if replace => {
                self.headers.insert(name, value);
            }
            Ok((name, value)) => {
                self.headers.append(name, value);
            }
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
    }

    /// Validates and freezes the descriptor.
    pub fn build(self) -> Result<RequestDescriptor, DescriptorError> {
        if let Some(e) = self.error {
            return Err(DescriptorError::InvalidHeader(e));
        }
        let base = self.base_url.ok_or(DescriptorError::MissingUrl)?;
        let mut url =
            Url::parse(&base).map_err(|source| DescriptorError::InvalidUrl { url: base.clone(), source })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DescriptorError::UnsupportedScheme(url.scheme().to_owned()));
        }
        join_paths(&mut url, &self.paths);
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query);
        }
        // Fragments stay on the descriptor's URL but never go on the wire.
        let mut target = url.clone();
        target.set_fragment(None);
        let uri = to_uri(&target)?;

        let proxy = match self.proxy {
            Some(p) => {
                let parsed = Url::parse(&p).map_err(|_| DescriptorError::InvalidProxy(p.clone()))?;
                if parsed.scheme() != "http" || parsed.host_str().is_none() {
                    return Err(DescriptorError::InvalidProxy(p));
                }
                Some(to_uri(&parsed).map_err(|_| DescriptorError::InvalidProxy(p))?)
            }
            None => None,
        };

        Ok(RequestDescriptor {
            method: self.method,
            url,
            uri,
            headers: self.headers,
            body: self.body,
            proxy,
            timeout: (!self.timeout.is_zero()).then_some(self.timeout),
            trace: self.trace,
            interceptors: self.interceptors,
            mutators: self.mutators,
            logger: self.logger,
            stream: self.stream,
        })
    }
}

impl fmt::Debug for DescriptorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorBuilder")
            .field("base_url", &self.base_url)
            .field("paths", &self.paths)
            .field("method", &self.method)
            .field("interceptors", &self.interceptors.len())
            .finish_non_exhaustive()
    }
}

/// Appends `paths` to the path of `url`, leaving its query and fragment alone.
fn join_paths(url: &mut Url, paths: &[String]) {
    if paths.iter().all(String::is_empty) {
        return;
    }
    let mut out = url.path().to_owned();
    for segment in paths.iter().filter(|p| !p.is_empty()) {
        match (out.ends_with('/'), segment.starts_with('/')) {
            (true, true) => out.push_str(&segment[1..]),
            (false, false) => {
                out.push('/');
                out.push_str(segment);
            }
            _ => out.push_str(segment),
        }
    }
    url.set_path(&out);
}

fn to_uri(url: &Url) -> Result<Uri, DescriptorError> {
    url.as_str().parse().map_err(|_| DescriptorError::InvalidTarget(url.to_string()))
}

// ── RequestDescriptor ─────────────────────────────────────────────────────────

/// The validated, immutable parameters of one call.
#[derive(Clone)]
pub struct RequestDescriptor {
    method: Method,
    url: Url,
    uri: Uri,
    headers: HeaderMap,
    body: RequestBody,
    proxy: Option<Uri>,
    timeout: Option<Duration>,
    trace: TraceConfig,
    interceptors: Vec<RoundTripInterceptor>,
    mutators: Vec<RequestMutator>,
    logger: Option<StatLogger>,
    stream: Option<StreamCallback>,
}

impl RequestDescriptor {
    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn proxy(&self) -> Option<&Uri> {
        self.proxy.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn trace(&self) -> TraceConfig {
        self.trace
    }

    pub fn interceptors(&self) -> &[RoundTripInterceptor] {
        &self.interceptors
    }

    pub fn mutators(&self) -> &[RequestMutator] {
        &self.mutators
    }

    pub fn logger(&self) -> Option<&StatLogger> {
        self.logger.as_ref()
    }

    pub fn stream_callback(&self) -> Option<&StreamCallback> {
        self.stream.as_ref()
    }

    pub fn is_stream_mode(&self) -> bool {
        self.stream.is_some()
    }

    /// Assembles a fresh outgoing request. Takes a streaming body, so a
    /// descriptor sharing a reader can only produce one request.
    pub(crate) fn to_request(&self) -> Result<OutgoingRequest, DescriptorError> {
        let mut req = http::Request::new(self.body.claim()?);
        *req.method_mut() = self.method.into();
        *req.uri_mut() = self.uri.clone();
        *req.headers_mut() = self.headers.clone();
        Ok(req)
    }
}

impl fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("proxy", &self.proxy)
            .field("timeout", &self.timeout)
            .field("trace", &self.trace)
            .field("interceptors", &self.interceptors.len())
            .field("mutators", &self.mutators.len())
            .field("stream_mode", &self.is_stream_mode())
            .finish()
    }
}
