//! Per-call instrumentation.
//!
//! Every call owns a [`Collector`]. It is created before the round trip with a
//! fresh request id and start time, shares a [`Timeline`] with the transport
//! (through the outgoing request's extensions) so lifecycle milestones can be
//! stamped as they happen, and is consumed by [`Collector::finish`] when the
//! call ends. `finish` takes `self`, so the logging callback runs at most once
//! per call, and only with a complete [`Stat`].
//!
//! # Milestones
//!
//! ```text
//! start → dns resolved → connected → tls done → written → first byte → body read
//!   └─ dns_lookup ─┘└ tcp_connect ┘└ tls_handshake ┘└ request_write ┘
//!                          server_processing: written → first byte
//!                          content_transfer:  first byte → body read
//! ```
//!
//! A milestone stamped more than once (a connection retry, for example) keeps
//! the last stamp, which reflects the attempt that produced the response.
//! Phases are measured between consecutive milestones that were actually
//! reached, clamped at zero, so their sum never exceeds `total`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tracing::{debug, warn};

use crate::error::Error;
use crate::method::Method;

/// Callback that receives every finalised [`Stat`].
pub type StatLogger = Arc<dyn Fn(&Stat) + Send + Sync>;

/// Default cap on captured bytes per direction.
pub const DEFAULT_TRACE_CAP: usize = 4096;

/// A transport-level lifecycle point, in the order a call reaches them.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Milestone {
    DnsResolved,
    Connected,
    TlsHandshake,
    RequestWritten,
    FirstByte,
    BodyRead,
}

impl Milestone {
    const ALL: [Milestone; 6] = [
        Self::DnsResolved,
        Self::Connected,
        Self::TlsHandshake,
        Self::RequestWritten,
        Self::FirstByte,
        Self::BodyRead,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// How much raw traffic to keep on the [`Stat`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TraceConfig {
    /// 0 captures nothing, 1 captures request/response heads, 2 adds body bytes.
    pub level: u8,
    /// Maximum bytes kept per direction.
    pub cap: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self { level: 0, cap: DEFAULT_TRACE_CAP }
    }
}

impl TraceConfig {
    pub fn captures_heads(&self) -> bool {
        self.level >= 1
    }

    pub fn captures_bodies(&self) -> bool {
        self.level >= 2
    }
}

/// Request extension carrying the id of the call's [`Stat`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(pub String);

// ── Timeline ──────────────────────────────────────────────────────────────────

/// Milestone stamps and trace captures for one call.
///
/// Cloning shares the same record. The session puts one into every outgoing
/// request's extensions; transports and interceptors stamp it with
/// [`Timeline::mark`].
#[derive(Clone, Default)]
pub struct Timeline {
    inner: Arc<Mutex<TimelineState>>,
}

#[derive(Default)]
struct TimelineState {
    marks: [Option<Instant>; 6],
    request_dump: BytesMut,
    response_dump: BytesMut,
}

impl Timeline {
    /// Stamps `milestone` with the current time. Last write wins.
    pub fn mark(&self, milestone: Milestone) {
        self.state().marks[milestone.index()] = Some(Instant::now());
    }

    pub fn get(&self, milestone: Milestone) -> Option<Instant> {
        self.state().marks[milestone.index()]
    }

    pub(crate) fn capture_request(&self, bytes: &[u8], cap: usize) {
        append_capped(&mut self.state().request_dump, bytes, cap);
    }

    pub(crate) fn capture_response(&self, bytes: &[u8], cap: usize) {
        append_capped(&mut self.state().response_dump, bytes, cap);
    }

    fn state(&self) -> MutexGuard<'_, TimelineState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeline").field("marks", &self.state().marks).finish()
    }
}

fn append_capped(buf: &mut BytesMut, bytes: &[u8], cap: usize) {
    let room = cap.saturating_sub(buf.len());
    buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
}

/// Renders a request head the way it goes on the wire.
pub(crate) fn request_head<B>(req: &http::Request<B>) -> Vec<u8> {
    let mut head = format!("{} {} {:?}\r\n", req.method(), req.uri(), req.version());
    push_headers(&mut head, req.headers());
    head.into_bytes()
}

/// Renders a response head the way it came off the wire.
pub(crate) fn response_head<B>(res: &http::Response<B>) -> Vec<u8> {
    let mut head = format!("{:?} {}\r\n", res.version(), res.status());
    push_headers(&mut head, res.headers());
    head.into_bytes()
}

fn push_headers(out: &mut String, headers: &http::HeaderMap) {
    for (name, value) in headers {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(&String::from_utf8_lossy(value.as_bytes()));
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
}

// ── Stat ──────────────────────────────────────────────────────────────────────

/// Durations between consecutive milestones. `None` when the call never
/// reached the closing milestone of that phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timings {
    pub dns_lookup: Option<Duration>,
    pub tcp_connect: Option<Duration>,
    pub tls_handshake: Option<Duration>,
    pub request_write: Option<Duration>,
    pub server_processing: Option<Duration>,
    pub content_transfer: Option<Duration>,
}

impl Timings {
    /// Sum of every recorded phase.
    pub fn sum(&self) -> Duration {
        [
            self.dns_lookup,
            self.tcp_connect,
            self.tls_handshake,
            self.request_write,
            self.server_processing,
            self.content_transfer,
        ]
        .into_iter()
        .flatten()
        .sum()
    }

    fn from_marks(start: Instant, marks: &[Option<Instant>; 6]) -> (Self, Instant) {
        let mut cursor = start;
        let mut phases = [None; 6];
        for milestone in Milestone::ALL {
            if let Some(at) = marks[milestone.index()] {
                phases[milestone.index()] = Some(at.saturating_duration_since(cursor));
                cursor = cursor.max(at);
            }
        }
        let timings = Self {
            dns_lookup: phases[0],
            tcp_connect: phases[1],
            tls_handshake: phases[2],
            request_write: phases[3],
            server_processing: phases[4],
            content_transfer: phases[5],
        };
        (timings, cursor)
    }
}

/// The record of one call: identity, timing, and outcome.
#[derive(Clone, Debug)]
pub struct Stat {
    pub request_id: String,
    pub method: Method,
    pub url: String,
    pub started_at: SystemTime,
    /// Wall-clock stamp of each milestone, indexed like [`Milestone`]. Read
    /// through [`Stat::timestamp`].
    pub marks: [Option<SystemTime>; 6],
    pub timings: Timings,
    pub total: Duration,
    pub status: Option<StatusCode>,
    pub bytes_read: u64,
    pub error: Option<String>,
    /// Raw request head (and body with trace level 2), capped.
    pub request_dump: Option<Bytes>,
    /// Raw response head (and body with trace level 2), capped.
    pub response_dump: Option<Bytes>,
}

impl Stat {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// When the call reached `milestone`, if it did.
    pub fn timestamp(&self, milestone: Milestone) -> Option<SystemTime> {
        self.marks[milestone.index()]
    }
}

// ── Collector ─────────────────────────────────────────────────────────────────

/// Builds the [`Stat`] for one call.
pub(crate) struct Collector {
    request_id: String,
    method: Method,
    url: String,
    started_at: SystemTime,
    start: Instant,
    timeline: Timeline,
    trace: TraceConfig,
    logger: Option<StatLogger>,
    status: Option<StatusCode>,
    bytes_read: u64,
}

impl Collector {
    pub(crate) fn start(
        method: Method,
        url: String,
        trace: TraceConfig,
        logger: Option<StatLogger>,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            method,
            url,
            started_at: SystemTime::now(),
            start: Instant::now(),
            timeline: Timeline::default(),
            trace,
            logger,
            status: None,
            bytes_read: 0,
        }
    }

    pub(crate) fn request_id(&self) -> &str {
        &self.request_id
    }

    pub(crate) fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub(crate) fn trace(&self) -> TraceConfig {
        self.trace
    }

    pub(crate) fn record_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// Counts body bytes read so far and captures them if tracing bodies.
    pub(crate) fn record_chunk(&mut self, chunk: &[u8]) {
        self.bytes_read += chunk.len() as u64;
        if self.trace.captures_bodies() {
            self.timeline.capture_response(chunk, self.trace.cap);
        }
    }

    /// Finalises the call and hands the Stat to the logging callback.
    pub(crate) fn finish(self, error: Option<&Error>) -> Stat {
        let stat = self.build(Instant::now(), error);
        match &stat.error {
            None => debug!(
                request_id = %stat.request_id,
                status = stat.status.map(|s| s.as_u16()),
                bytes = stat.bytes_read,
                total_ms = stat.total.as_millis() as u64,
                "request finished"
            ),
            Some(e) => warn!(
                request_id = %stat.request_id,
                total_ms = stat.total.as_millis() as u64,
                error = %e,
                "request failed"
            ),
        }
        if let Some(logger) = &self.logger {
            logger(&stat);
        }
        stat
    }

    fn build(&self, now: Instant, error: Option<&Error>) -> Stat {
        let state = self.timeline.state();
        let (timings, last) = Timings::from_marks(self.start, &state.marks);
        let end = now.max(last);
        let marks = state
            .marks
            .map(|at| at.map(|at| self.started_at + at.saturating_duration_since(self.start)));
        let dump = |buf: &BytesMut| self.trace.captures_heads().then(|| Bytes::copy_from_slice(buf));
        Stat {
            request_id: self.request_id.clone(),
            method: self.method,
            url: self.url.clone(),
            started_at: self.started_at,
            marks,
            timings,
            total: end.duration_since(self.start),
            status: self.status,
            bytes_read: self.bytes_read,
            error: error.map(ToString::to_string),
            request_dump: dump(&state.request_dump),
            response_dump: dump(&state.response_dump),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collector(logger: Option<StatLogger>) -> Collector {
        Collector::start(Method::Get, "http://example.test/".into(), TraceConfig::default(), logger)
    }

    #[test]
    fn phases_never_exceed_total() {
        let c = collector(None);
        let tl = c.timeline().clone();
        for m in Milestone::ALL {
            std::thread::sleep(Duration::from_millis(2));
            tl.mark(m);
        }
        let stat = c.finish(None);

        assert!(stat.timings.sum() <= stat.total);
        assert!(stat.timings.dns_lookup.is_some());
        assert!(stat.timings.content_transfer.is_some());
        let t = stat.timings;
        let pair = t.server_processing.unwrap() + t.dns_lookup.unwrap();
        assert!(stat.total >= pair);

        let mut previous = stat.started_at;
        for m in Milestone::ALL {
            let at = stat.timestamp(m).unwrap();
            assert!(at >= previous, "{m:?} stamped before the milestone ahead of it");
            previous = at;
        }
        assert!(previous <= stat.started_at + stat.total);
    }

    #[test]
    fn out_of_order_stamps_clamp_to_zero() {
        let c = collector(None);
        let tl = c.timeline().clone();
        tl.mark(Milestone::FirstByte);
        std::thread::sleep(Duration::from_millis(2));
        // A retried connection re-stamps an earlier milestone after a later one.
        tl.mark(Milestone::Connected);
        let stat = c.finish(None);

        assert_eq!(stat.timings.server_processing, Some(Duration::ZERO));
        assert!(stat.timings.sum() <= stat.total);
    }

    #[test]
    fn last_stamp_wins() {
        let tl = Timeline::default();
        tl.mark(Milestone::Connected);
        let first = tl.get(Milestone::Connected).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        tl.mark(Milestone::Connected);
        assert!(tl.get(Milestone::Connected).unwrap() > first);
    }

    #[test]
    fn logger_runs_once_with_outcome() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let logger: StatLogger = Arc::new(move |stat: &Stat| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(stat.error.as_deref(), Some("request canceled"));
        });

        let stat = collector(Some(logger)).finish(Some(&Error::Canceled));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!stat.is_success());
        assert!(stat.request_dump.is_none());
        assert_eq!(stat.timestamp(Milestone::Connected), None);
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(collector(None).request_id(), collector(None).request_id());
    }

    #[test]
    fn captures_respect_level_and_cap() {
        let trace = TraceConfig { level: 2, cap: 4 };
        let mut c = Collector::start(Method::Post, "http://x/".into(), trace, None);
        c.timeline().capture_request(b"POST / HTTP/1.1", trace.cap);
        c.record_chunk(b"abcdef");
        let stat = c.finish(None);

        assert_eq!(stat.request_dump.as_deref(), Some(&b"POST"[..]));
        assert_eq!(stat.response_dump.as_deref(), Some(&b"abcd"[..]));
        assert_eq!(stat.bytes_read, 6);
    }
}
