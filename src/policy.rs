//! Classification of request outcomes for the breaker.

use crate::error::TransportError;
use crate::transport::Body;

/// Decides which outcomes count as breaker failures.
pub trait FailurePolicy: Send + Sync + 'static {
    /// Returns true if a completed transport call should count towards the
    /// failure threshold.
    fn is_failure(&self, outcome: &Result<http::Response<Body>, TransportError>) -> bool;
}

/// Counts every transport error and every server error response (status
/// 500 and above). Timeouts count like any other transport error.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl FailurePolicy for DefaultPolicy {
    fn is_failure(&self, outcome: &Result<http::Response<Body>, TransportError>) -> bool {
        match outcome {
            Ok(response) => response.status().as_u16() >= 500,
            Err(_) => true,
        }
    }
}

/// Like [`DefaultPolicy`] but does not count timeouts, for callers that use
/// short deadlines to cancel work they no longer need.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreTimeoutsPolicy;

impl FailurePolicy for IgnoreTimeoutsPolicy {
    fn is_failure(&self, outcome: &Result<http::Response<Body>, TransportError>) -> bool {
        match outcome {
            Err(TransportError::Timeout) => false,
            other => DefaultPolicy.is_failure(other),
        }
    }
}
