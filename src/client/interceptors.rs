//! Ready-made client interceptors.

use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use tracing::warn;

use crate::X_REQUEST_ID;
use crate::chain::{BoxFuture, Interceptor, Next};
use crate::client::stat::RequestId;
use crate::client::transport::{OutgoingRequest, RoundTripResult};

/// Stamps every outgoing request with the call's request id, so server logs
/// can be matched against the client [`Stat`](crate::client::Stat).
///
/// A header the caller already set is left alone.
#[derive(Clone, Debug)]
pub struct RequestIdInterceptor {
    header: HeaderName,
}

impl Default for RequestIdInterceptor {
    fn default() -> Self {
        Self { header: X_REQUEST_ID }
    }
}

impl RequestIdInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `header` instead of `x-request-id`.
    pub fn header(header: HeaderName) -> Self {
        Self { header }
    }
}

impl Interceptor<OutgoingRequest, RoundTripResult> for RequestIdInterceptor {
    fn handle(
        &self,
        mut req: OutgoingRequest,
        next: Next<OutgoingRequest, RoundTripResult>,
    ) -> BoxFuture<'_, RoundTripResult> {
        if !req.headers().contains_key(&self.header) {
            let id = match req.extensions().get::<RequestId>() {
                Some(RequestId(id)) => id.clone(),
                None => uuid::Uuid::new_v4().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&id) {
                req.headers_mut().insert(self.header.clone(), value);
            }
        }
        Box::pin(next.run(req))
    }
}

/// Re-issues a request that failed at the transport level.
///
/// Only transport errors are retried: timeouts, cancellation and non-2xx
/// responses pass straight through. Requests with a streaming body are sent
/// once, since the stream cannot be replayed. Waits `backoff × attempt`
/// between attempts.
#[derive(Clone, Debug)]
pub struct Retry {
    attempts: u32,
    backoff: Duration,
}

impl Retry {
    /// Up to `attempts` tries in total. Zero is treated as one.
    pub fn new(attempts: u32) -> Self {
        Self { attempts: attempts.max(1), backoff: Duration::from_millis(100) }
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Interceptor<OutgoingRequest, RoundTripResult> for Retry {
    fn handle(
        &self,
        req: OutgoingRequest,
        next: Next<OutgoingRequest, RoundTripResult>,
    ) -> BoxFuture<'_, RoundTripResult> {
        Box::pin(async move {
            let mut req = req;
            let mut attempt = 1;
            loop {
                let replay = (attempt < self.attempts).then(|| replayable(&req)).flatten();
                let result = next.clone().run(req).await;
                match (result, replay) {
                    (Err(e), Some(again)) if e.is_transport() => {
                        warn!(attempt, error = %e, "round trip failed, retrying");
                        tokio::time::sleep(self.backoff * attempt).await;
                        req = again;
                        attempt += 1;
                    }
                    (result, _) => return result,
                }
            }
        })
    }
}

fn replayable(req: &OutgoingRequest) -> Option<OutgoingRequest> {
    let body = req.body().try_clone()?;
    let mut copy = http::Request::new(body);
    *copy.method_mut() = req.method().clone();
    *copy.uri_mut() = req.uri().clone();
    *copy.version_mut() = req.version();
    *copy.headers_mut() = req.headers().clone();
    *copy.extensions_mut() = req.extensions().clone();
    Some(copy)
}
