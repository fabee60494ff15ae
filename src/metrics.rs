//! Latency metrics and the sinks they are published to.

use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use crate::counter::{AvgRateCounter, Metric, RateCounter};

/// Default prefix of the published metric names.
pub const DEFAULT_NAME: &str = "thc";

/// Window of the latency averages.
const LATENCY_WINDOW: Duration = Duration::from_secs(60);

/// Window of the out-of-service event counter.
const OUT_OF_SERVICE_WINDOW: Duration = Duration::from_secs(3600);

/// Name suffixes, in publication order.
pub const METRIC_SUFFIXES: [&str; 7] = [
    "dns-lookup",
    "tcp-connection",
    "tls-handshake",
    "get-connection",
    "write-request",
    "get-response",
    "outofservice",
];

/// Trait for external sinks receiving the client's metrics.
pub trait MetricSink: Send + Sync + 'static {
    /// Exposes `metric` under `name`.
    fn publish(&self, name: &str, metric: Arc<dyn Metric>);
}

/// A null metrics sink that discards all publications.
pub struct NullMetricSink;

impl MetricSink for NullMetricSink {
    fn publish(&self, _name: &str, _metric: Arc<dyn Metric>) {}
}

/// In-memory set of published metrics, readable by name.
///
/// Clones share the same underlying map.
#[derive(Clone, Default)]
pub struct VarSet {
    vars: Arc<RwLock<AHashMap<String, Arc<dyn Metric>>>>,
}

impl VarSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the metric published under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Metric>> {
        self.vars.read().get(name).cloned()
    }

    /// Returns the current value of the metric published under `name`.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.get(name).map(|m| m.value())
    }

    /// Published names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.vars.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Calls `f` with every name and its current value, in name order.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, f64),
    {
        let mut vars: Vec<(String, Arc<dyn Metric>)> = self
            .vars
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, metric) in vars {
            f(&name, metric.value());
        }
    }
}

impl MetricSink for VarSet {
    fn publish(&self, name: &str, metric: Arc<dyn Metric>) {
        if self.vars.write().insert(name.to_string(), metric).is_some() {
            tracing::warn!(name, "Metric published twice, replacing previous value");
        }
    }
}

/// The counters of one client instance. Latencies are in nanoseconds,
/// averaged per minute.
#[derive(Debug)]
pub struct Metrics {
    /// Time to perform a DNS lookup.
    pub dns_lookup: Arc<AvgRateCounter>,
    /// Time to open a new TCP connection.
    pub tcp_connection: Arc<AvgRateCounter>,
    /// Time to perform a TLS handshake.
    pub tls_handshake: Arc<AvgRateCounter>,

    /// Total time to get a ready-to-use connection. Includes the three
    /// previous metrics; near zero when a pooled connection is reused.
    pub get_connection: Arc<AvgRateCounter>,
    /// Time until the request was fully written, including `get_connection`.
    pub write_request: Arc<AvgRateCounter>,
    /// Time until the first response byte, including `write_request`.
    pub get_response: Arc<AvgRateCounter>,

    /// How many times per hour the client went out of service.
    pub out_of_service: Arc<RateCounter>,
}

/// Plain copy of the metric values at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// See [`Metrics::dns_lookup`].
    pub dns_lookup: f64,
    /// See [`Metrics::tcp_connection`].
    pub tcp_connection: f64,
    /// See [`Metrics::tls_handshake`].
    pub tls_handshake: f64,
    /// See [`Metrics::get_connection`].
    pub get_connection: f64,
    /// See [`Metrics::write_request`].
    pub write_request: f64,
    /// See [`Metrics::get_response`].
    pub get_response: f64,
    /// See [`Metrics::out_of_service`].
    pub out_of_service: i64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates a fresh, unpublished set of counters.
    pub fn new() -> Self {
        Self {
            dns_lookup: Arc::new(AvgRateCounter::new(LATENCY_WINDOW)),
            tcp_connection: Arc::new(AvgRateCounter::new(LATENCY_WINDOW)),
            tls_handshake: Arc::new(AvgRateCounter::new(LATENCY_WINDOW)),
            get_connection: Arc::new(AvgRateCounter::new(LATENCY_WINDOW)),
            write_request: Arc::new(AvgRateCounter::new(LATENCY_WINDOW)),
            get_response: Arc::new(AvgRateCounter::new(LATENCY_WINDOW)),
            out_of_service: Arc::new(RateCounter::new(OUT_OF_SERVICE_WINDOW)),
        }
    }

    /// Publishes every counter to `sink` as `<prefix>-<suffix>`.
    pub fn publish(&self, prefix: &str, sink: &dyn MetricSink) {
        let prefix = if prefix.is_empty() {
            DEFAULT_NAME
        } else {
            prefix
        };

        for (suffix, metric) in METRIC_SUFFIXES.iter().zip(self.as_metrics()) {
            sink.publish(&format!("{}-{}", prefix, suffix), metric);
        }

        tracing::debug!(prefix, "Published client metrics");
    }

    /// Reads all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dns_lookup: self.dns_lookup.average(),
            tcp_connection: self.tcp_connection.average(),
            tls_handshake: self.tls_handshake.average(),
            get_connection: self.get_connection.average(),
            write_request: self.write_request.average(),
            get_response: self.get_response.average(),
            out_of_service: self.out_of_service.rate(),
        }
    }

    fn as_metrics(&self) -> [Arc<dyn Metric>; 7] {
        [
            self.dns_lookup.clone(),
            self.tcp_connection.clone(),
            self.tls_handshake.clone(),
            self.get_connection.clone(),
            self.write_request.clone(),
            self.get_response.clone(),
            self.out_of_service.clone(),
        ]
    }
}

#[cfg(feature = "prometheus")]
mod prometheus {
    use super::MetricSink;
    use crate::counter::Metric;
    use parking_lot::Mutex;
    use prometheus_client::encoding::{EncodeMetric, MetricEncoder};
    use prometheus_client::metrics::MetricType;
    use prometheus_client::registry::Registry;
    use std::fmt;
    use std::sync::Arc;

    struct Published(Arc<dyn Metric>);

    impl fmt::Debug for Published {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_tuple("Published").field(&self.0.value()).finish()
        }
    }

    impl EncodeMetric for Published {
        fn encode(&self, mut encoder: MetricEncoder) -> Result<(), fmt::Error> {
            encoder.encode_gauge(&self.0.value())
        }

        fn metric_type(&self) -> MetricType {
            MetricType::Gauge
        }
    }

    /// Registers every published metric as a gauge of a Prometheus registry.
    #[cfg_attr(docsrs, doc(cfg(feature = "prometheus")))]
    #[derive(Clone)]
    pub struct PrometheusSink {
        registry: Arc<Mutex<Registry>>,
    }

    impl PrometheusSink {
        /// Wraps a shared registry.
        pub fn new(registry: Arc<Mutex<Registry>>) -> Self {
            Self { registry }
        }

        /// Returns the wrapped registry.
        pub fn registry(&self) -> Arc<Mutex<Registry>> {
            Arc::clone(&self.registry)
        }
    }

    impl MetricSink for PrometheusSink {
        fn publish(&self, name: &str, metric: Arc<dyn Metric>) {
            let name = name.replace('-', "_");
            self.registry
                .lock()
                .register(name, "Timed HTTP client metric", Published(metric));
        }
    }
}

#[cfg(feature = "prometheus")]
pub use self::prometheus::PrometheusSink;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_seven_prefixed_series() {
        let vars = VarSet::new();
        let metrics = Metrics::new();
        metrics.publish("api", &vars);

        assert_eq!(
            vars.names(),
            vec![
                "api-dns-lookup",
                "api-get-connection",
                "api-get-response",
                "api-outofservice",
                "api-tcp-connection",
                "api-tls-handshake",
                "api-write-request",
            ]
        );
    }

    #[test]
    fn empty_prefix_falls_back_to_default() {
        let vars = VarSet::new();
        Metrics::new().publish("", &vars);

        assert!(vars.get("thc-get-response").is_some());
    }

    #[test]
    fn sink_reads_live_values() {
        let vars = VarSet::new();
        let metrics = Metrics::new();
        metrics.publish("live", &vars);

        metrics.get_response.incr(300);
        metrics.get_response.incr(100);
        metrics.out_of_service.incr(1);

        assert_eq!(vars.value("live-get-response"), Some(200.0));
        assert_eq!(vars.value("live-outofservice"), Some(1.0));
        assert_eq!(metrics.snapshot().out_of_service, 1);
    }

    #[test]
    fn for_each_visits_in_name_order() {
        let vars = VarSet::new();
        Metrics::new().publish("x", &vars);

        let mut seen = Vec::new();
        vars.for_each(|name, value| {
            assert_eq!(value, 0.0);
            seen.push(name.to_string());
        });

        assert_eq!(seen, vars.names());
    }
}
