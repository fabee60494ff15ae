//! Per-request lifecycle tracing.
//!
//! A [`ClientTrace`] is created for every dispatched request and stored in
//! the request's extensions. Transports look it up with
//! [`ClientTrace::from_request`] and call the event methods as the request
//! progresses. Each end event turns its elapsed time into one nanosecond
//! sample on the matching counter.
//!
//! ```text
//! get_conn ─┬─ dns_start ── dns_done                  -> dns_lookup
//!           ├─ connect_start ── connect_done          -> tcp_connection
//!           ├─ tls_handshake_start ── ..._done        -> tls_handshake
//!           ├──────────────── got_conn                -> get_connection
//!           ├──────────────────────── wrote_request   -> write_request
//!           └──────────────── got_first_response_byte -> get_response
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::counter::AvgRateCounter;
use crate::metrics::Metrics;

/// Timestamp slot, stored as nanoseconds since the trace was created plus
/// one. Zero means the event has not fired.
#[derive(Debug, Default)]
struct Slot(AtomicU64);

impl Slot {
    fn mark(&self, base: Instant) {
        let nanos = base.elapsed().as_nanos().min(u64::MAX as u128 - 1) as u64;
        self.0.store(nanos + 1, Ordering::Release);
    }

    fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            n => Some(n - 1),
        }
    }

    /// Consumes the slot so the matching end event records at most once.
    fn take(&self) -> Option<u64> {
        match self.0.swap(0, Ordering::AcqRel) {
            0 => None,
            n => Some(n - 1),
        }
    }
}

#[derive(Debug)]
struct TraceInner {
    metrics: Arc<Metrics>,
    base: Instant,
    get_conn: Slot,
    dns_start: Slot,
    connect_start: Slot,
    tls_start: Slot,
}

/// Lifecycle hooks of a single request.
///
/// Cloning yields a handle to the same timestamps, which is what request
/// extensions need. Separate requests never share a trace.
#[derive(Debug, Clone)]
pub struct ClientTrace {
    inner: Arc<TraceInner>,
}

impl ClientTrace {
    /// Creates a trace recording into `metrics`.
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(TraceInner {
                metrics,
                base: Instant::now(),
                get_conn: Slot::default(),
                dns_start: Slot::default(),
                connect_start: Slot::default(),
                tls_start: Slot::default(),
            }),
        }
    }

    /// Returns the trace attached to `request`, if any.
    pub fn from_request<B>(request: &http::Request<B>) -> Option<&ClientTrace> {
        request.extensions().get::<ClientTrace>()
    }

    /// Attaches this trace to `request`, replacing any previous one.
    pub fn attach<B>(&self, request: &mut http::Request<B>) {
        request.extensions_mut().insert(self.clone());
    }

    /// A connection is about to be acquired. Anchor of the cumulative
    /// metrics.
    pub fn get_conn(&self) {
        self.inner.get_conn.mark(self.inner.base);
    }

    /// Name resolution started.
    pub fn dns_start(&self) {
        self.inner.dns_start.mark(self.inner.base);
    }

    /// Name resolution finished.
    pub fn dns_done(&self) {
        self.phase_done(&self.inner.dns_start, &self.inner.metrics.dns_lookup);
    }

    /// A TCP dial started.
    pub fn connect_start(&self) {
        self.inner.connect_start.mark(self.inner.base);
    }

    /// A TCP dial finished, successfully or not.
    pub fn connect_done(&self) {
        self.phase_done(
            &self.inner.connect_start,
            &self.inner.metrics.tcp_connection,
        );
    }

    /// A TLS handshake started.
    pub fn tls_handshake_start(&self) {
        self.inner.tls_start.mark(self.inner.base);
    }

    /// A TLS handshake finished, successfully or not.
    pub fn tls_handshake_done(&self) {
        self.phase_done(&self.inner.tls_start, &self.inner.metrics.tls_handshake);
    }

    /// A connection is ready for the request.
    pub fn got_conn(&self) {
        self.since_anchor(&self.inner.metrics.get_connection);
    }

    /// The request has been fully written.
    pub fn wrote_request(&self) {
        self.since_anchor(&self.inner.metrics.write_request);
    }

    /// The first byte of the response arrived.
    pub fn got_first_response_byte(&self) {
        self.since_anchor(&self.inner.metrics.get_response);
    }

    fn now(&self) -> u64 {
        self.inner.base.elapsed().as_nanos().min(u64::MAX as u128) as u64
    }

    fn phase_done(&self, start: &Slot, counter: &AvgRateCounter) {
        if let Some(started) = start.take() {
            counter.incr(elapsed(started, self.now()));
        }
    }

    fn since_anchor(&self, counter: &AvgRateCounter) {
        if let Some(anchor) = self.inner.get_conn.get() {
            counter.incr(elapsed(anchor, self.now()));
        }
    }
}

fn elapsed(from: u64, to: u64) -> i64 {
    to.saturating_sub(from).min(i64::MAX as u64) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn pause() {
        thread::sleep(Duration::from_millis(2));
    }

    #[test]
    fn full_waterfall() {
        let metrics = Arc::new(Metrics::new());
        let trace = ClientTrace::new(Arc::clone(&metrics));

        trace.get_conn();
        trace.dns_start();
        pause();
        trace.dns_done();
        trace.connect_start();
        pause();
        trace.connect_done();
        trace.tls_handshake_start();
        pause();
        trace.tls_handshake_done();
        trace.got_conn();
        pause();
        trace.wrote_request();
        pause();
        trace.got_first_response_byte();

        let s = metrics.snapshot();
        assert!(s.dns_lookup > 0.0);
        assert!(s.tcp_connection > 0.0);
        assert!(s.tls_handshake > 0.0);
        assert!(s.get_connection >= s.dns_lookup + s.tcp_connection + s.tls_handshake);
        assert!(s.write_request > s.get_connection);
        assert!(s.get_response > s.write_request);
    }

    #[test]
    fn absent_phases_record_nothing() {
        let metrics = Arc::new(Metrics::new());
        let trace = ClientTrace::new(Arc::clone(&metrics));

        // A reused connection: no dial, no resolution.
        trace.get_conn();
        trace.dns_done();
        trace.connect_done();
        trace.got_conn();

        assert_eq!(metrics.dns_lookup.hits(), 0);
        assert_eq!(metrics.tcp_connection.hits(), 0);
        assert_eq!(metrics.get_connection.hits(), 1);
    }

    #[test]
    fn end_event_records_once() {
        let metrics = Arc::new(Metrics::new());
        let trace = ClientTrace::new(Arc::clone(&metrics));

        trace.connect_start();
        trace.connect_done();
        trace.connect_done();

        assert_eq!(metrics.tcp_connection.hits(), 1);
    }

    #[test]
    fn no_anchor_no_cumulative_samples() {
        let metrics = Arc::new(Metrics::new());
        let trace = ClientTrace::new(Arc::clone(&metrics));

        trace.wrote_request();
        trace.got_first_response_byte();

        assert_eq!(metrics.write_request.hits(), 0);
        assert_eq!(metrics.get_response.hits(), 0);
    }

    #[test]
    fn attach_and_lookup() {
        let metrics = Arc::new(Metrics::new());
        let trace = ClientTrace::new(Arc::clone(&metrics));
        let mut request = http::Request::new(Vec::<u8>::new());

        assert!(ClientTrace::from_request(&request).is_none());
        trace.attach(&mut request);

        let found = ClientTrace::from_request(&request).unwrap();
        found.get_conn();
        found.got_conn();
        assert_eq!(metrics.get_connection.hits(), 1);
    }

    #[test]
    fn traces_are_independent() {
        let metrics = Arc::new(Metrics::new());
        let a = ClientTrace::new(Arc::clone(&metrics));
        let b = ClientTrace::new(Arc::clone(&metrics));

        a.get_conn();
        b.got_conn();

        assert_eq!(metrics.get_connection.hits(), 0);
    }
}
