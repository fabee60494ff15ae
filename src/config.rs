//! Configuration for timed clients.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::client::{ClientInner, TimedClient};
use crate::hook::HookRegistry;
use crate::metrics::{MetricSink, NullMetricSink, DEFAULT_NAME};
use crate::policy::{DefaultPolicy, FailurePolicy};
use crate::schedule::{Scheduler, ThreadScheduler};
use crate::state::BreakerState;
use crate::transport::{HyperTransport, Transport};

/// Default lifespan of the out-of-service state.
pub const DEFAULT_HEALING_TIME: Duration = Duration::from_secs(10);

/// Builder for creating clients with custom configurations.
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    name: String,
    max_errors: u32,
    healing_time: Duration,
    policy: Arc<dyn FailurePolicy>,
    metric_sink: Arc<dyn MetricSink>,
    hook_registry: Arc<HookRegistry>,
    scheduler: Arc<dyn Scheduler>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            transport: Arc::new(HyperTransport::new()),
            name: DEFAULT_NAME.to_string(),
            max_errors: 0,
            healing_time: DEFAULT_HEALING_TIME,
            policy: Arc::new(DefaultPolicy),
            metric_sink: Arc::new(NullMetricSink),
            hook_registry: Arc::new(HookRegistry::new()),
            scheduler: Arc::new(ThreadScheduler),
        }
    }

    /// Sets the transport performing the requests.
    pub fn transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    /// Sets a transport shared with other clients.
    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the prefix of the published metric names. An empty name keeps
    /// the default, `thc`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.is_empty() {
            self.name = name;
        }
        self
    }

    /// Sets the number of consecutive failures after which the client goes
    /// out of service. Zero disables the breaker.
    pub fn max_errors(mut self, count: u32) -> Self {
        self.max_errors = count;
        self
    }

    /// Sets how long the client stays out of service. Zero keeps the
    /// default of 10 seconds.
    pub fn healing_time(mut self, duration: Duration) -> Self {
        if !duration.is_zero() {
            self.healing_time = duration;
        }
        self
    }

    /// Sets the policy deciding which outcomes are failures.
    pub fn policy<P: FailurePolicy>(mut self, policy: P) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Sets a metric sink for the client.
    pub fn metric_sink<M: MetricSink>(mut self, sink: M) -> Self {
        self.metric_sink = Arc::new(sink);
        self
    }

    /// Sets a hook registry for the client.
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hook_registry = Arc::new(hooks);
        self
    }

    /// Sets the scheduler running the delayed return to service.
    pub fn scheduler<S: Scheduler>(mut self, scheduler: S) -> Self {
        self.scheduler = Arc::new(scheduler);
        self
    }

    /// Builds a new client with the configured settings.
    pub fn build(self) -> TimedClient {
        TimedClient::from_inner(ClientInner {
            name: self.name,
            transport: self.transport,
            policy: self.policy,
            breaker: BreakerState::new(self.max_errors),
            healing_time: self.healing_time,
            metrics: OnceCell::new(),
            metric_sink: self.metric_sink,
            hooks: self.hook_registry,
            scheduler: self.scheduler,
        })
    }
}
