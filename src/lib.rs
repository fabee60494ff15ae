//! # timed-http-client
//!
//! A thin wrapper around an HTTP transport which provides latency metrics
//! and a circuit breaker.
//!
//! ## Metrics
//!
//! Every request is traced through its connection lifecycle. Average times
//! for DNS lookups, TCP connections, TLS handshakes, getting a connection,
//! writing the request and receiving the first response byte are kept over
//! a one minute window, in nanoseconds, and published to a [`MetricSink`]
//! as `<name>-dns-lookup`, `<name>-tcp-connection`, `<name>-tls-handshake`,
//! `<name>-get-connection`, `<name>-write-request` and `<name>-get-response`.
//! The last three are measured from the same starting point, so for any
//! request `get-connection <= write-request <= get-response`.
//!
//! ## Circuit breaker
//!
//! After a defined number of consecutive failures the client switches to an
//! *out of service* state. In this state it stops sending requests and
//! returns [`Error::OutOfService`] instead. It is up to the application to
//! decide what to do in that case. After the healing time the service is
//! restored and the client resumes normally. Each switch is counted in
//! `<name>-outofservice`, per hour.
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use timed_http_client::{Error, TimedClient, VarSet};
//!
//! let vars = VarSet::new();
//! let client = TimedClient::builder()
//!     .name("example")
//!     .max_errors(10)
//!     .healing_time(Duration::from_secs(20))
//!     .metric_sink(vars.clone())
//!     .build();
//! client.publish_metrics();
//!
//! loop {
//!     match client.get("http://127.0.0.1:8080/") {
//!         // Down for 20 seconds.
//!         Err(Error::OutOfService) => break,
//!         // Still under 10 consecutive errors.
//!         Err(_) => continue,
//!         Ok(response) => println!("{}", response.status()),
//!     }
//! }
//!
//! println!("{:?}", vars.value("example-get-response"));
//! ```
//!
//! ## Transports
//!
//! The default [`HyperTransport`] speaks HTTP/1.1 through hyper, over plain
//! TCP or rustls, and keeps idle connections for reuse. A request on a
//! reused connection records no DNS, TCP or TLS sample. Any other client
//! can be plugged in by implementing [`Transport`] and firing the
//! [`ClientTrace`] events found in the request's extensions.
//!
//! ## Features
//!
//! - `async` - [`TokioScheduler`] for running the return to service on a
//!   Tokio runtime
//! - `prometheus` - [`PrometheusSink`] publishing into a `prometheus-client`
//!   registry

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod client;
mod config;
mod connect;
mod counter;
mod error;
mod hook;
mod metrics;
mod policy;
pub mod prelude;
mod schedule;
mod state;
mod trace;
mod transport;

// Re-exports
pub use client::TimedClient;
pub use config::{ClientBuilder, DEFAULT_HEALING_TIME};
pub use counter::{AvgRateCounter, Metric, RateCounter};
pub use error::{ClientResult, Error, TransportError};
pub use hook::HookRegistry;
pub use metrics::{
    MetricSink, Metrics, MetricsSnapshot, NullMetricSink, VarSet, DEFAULT_NAME, METRIC_SUFFIXES,
};
pub use policy::{DefaultPolicy, FailurePolicy, IgnoreTimeoutsPolicy};
pub use schedule::{Scheduler, Task, ThreadScheduler};
pub use state::{BreakerState, State};
pub use trace::ClientTrace;
pub use transport::{Body, HyperTransport, Transport};

#[cfg(feature = "prometheus")]
pub use metrics::PrometheusSink;
#[cfg(feature = "async")]
pub use schedule::TokioScheduler;
