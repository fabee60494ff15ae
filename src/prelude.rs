//! Re-exports common types for convenient usage.
//!
//! # Example
//! ```rust,no_run
//! use timed_http_client::prelude::*;
//!
//! let client = TimedClient::builder().max_errors(3).build();
//! match client.get("http://127.0.0.1:8080/") {
//!     Err(Error::OutOfService) => {}
//!     other => drop(other),
//! }
//! ```

pub use crate::client::TimedClient;
pub use crate::config::ClientBuilder;
pub use crate::error::{ClientResult, Error, TransportError};
pub use crate::metrics::{MetricSink, VarSet};
pub use crate::state::State;
pub use crate::trace::ClientTrace;
pub use crate::transport::{Body, Transport};
