//! Consecutive-failure breaker state.

use std::sync::atomic::{AtomicU32, Ordering};

/// Observable state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Requests are dispatched to the transport.
    InService,

    /// The error threshold was reached; requests fail fast until the healing
    /// time elapses.
    OutOfService,
}

/// Tracks consecutive failures against a threshold. A threshold of zero
/// disables the breaker.
///
/// The count stays within `[0, threshold]`: failures arriving while the
/// breaker is already open are not counted.
#[derive(Debug)]
pub struct BreakerState {
    errors: AtomicU32,
    threshold: u32,
}

impl BreakerState {
    /// Creates a closed breaker.
    pub fn new(threshold: u32) -> Self {
        Self {
            errors: AtomicU32::new(0),
            threshold,
        }
    }

    /// Whether the breaker is enabled at all.
    pub fn enabled(&self) -> bool {
        self.threshold > 0
    }

    /// Failure threshold, zero when disabled.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Current number of consecutive failures.
    pub fn errors(&self) -> u32 {
        self.errors.load(Ordering::Acquire)
    }

    /// Gets the current state.
    pub fn current(&self) -> State {
        if self.enabled() && self.errors() >= self.threshold {
            State::OutOfService
        } else {
            State::InService
        }
    }

    /// Whether a request may be dispatched now.
    pub fn is_servable(&self) -> bool {
        self.current() == State::InService
    }

    /// Counts one failure. Returns true for exactly the one failure that
    /// moved the count onto the threshold.
    pub fn record_failure(&self) -> bool {
        if !self.enabled() {
            return false;
        }

        let threshold = self.threshold;
        match self
            .errors
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < threshold).then(|| n + 1)
            }) {
            Ok(previous) => previous + 1 == threshold,
            Err(_) => false,
        }
    }

    /// Clears the failure count after a success.
    pub fn record_success(&self) {
        if self.enabled() {
            self.errors.store(0, Ordering::Release);
        }
    }

    /// Unconditionally clears the failure count. Safe to apply repeatedly.
    pub fn reset(&self) {
        self.errors.store(0, Ordering::Release);
    }
}
