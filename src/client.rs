//! The timed HTTP client.

use std::sync::{Arc, Weak};
use std::time::Duration;

use http::header::CONTENT_TYPE;
use http::{Method, Request, Response};
use once_cell::sync::OnceCell;

use crate::error::{ClientResult, Error};
use crate::hook::HookRegistry;
use crate::metrics::{MetricSink, Metrics};
use crate::policy::FailurePolicy;
use crate::schedule::Scheduler;
use crate::state::{BreakerState, State};
use crate::trace::ClientTrace;
use crate::transport::{Body, Transport};

/// Inner state of the client, shared between clones.
pub(crate) struct ClientInner {
    pub(crate) name: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) policy: Arc<dyn FailurePolicy>,
    pub(crate) breaker: BreakerState,
    pub(crate) healing_time: Duration,
    pub(crate) metrics: OnceCell<Arc<Metrics>>,
    pub(crate) metric_sink: Arc<dyn MetricSink>,
    pub(crate) hooks: Arc<HookRegistry>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
}

/// Timed HTTP client: wraps a [`Transport`] with latency metrics and a
/// consecutive-failure circuit breaker.
///
/// After `max_errors` consecutive failures the client goes out of service
/// and returns [`Error::OutOfService`] without sending anything. Service
/// resumes once the healing time has elapsed. A failure is a transport error
/// or a response with status 500 or above, unless another
/// [`FailurePolicy`] is configured.
///
/// Cloning is cheap; clones share the breaker and the metrics.
#[derive(Clone)]
pub struct TimedClient {
    inner: Arc<ClientInner>,
}

impl Default for TimedClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TimedClient {
    /// Creates a client with the default transport, no breaker and
    /// metrics going to a [`NullMetricSink`](crate::NullMetricSink).
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a new builder for customizing a client.
    pub fn builder() -> crate::config::ClientBuilder {
        crate::config::ClientBuilder::new()
    }

    pub(crate) fn from_inner(inner: ClientInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Prefix of the published metric names.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of consecutive failures after which the client goes out of
    /// service. Zero means never.
    pub fn max_errors(&self) -> u32 {
        self.inner.breaker.threshold()
    }

    /// How long the client stays out of service.
    pub fn healing_time(&self) -> Duration {
        self.inner.healing_time
    }

    /// Gets the current state of the client.
    pub fn state(&self) -> State {
        self.inner.breaker.current()
    }

    /// Current number of consecutive failures.
    pub fn consecutive_errors(&self) -> u32 {
        self.inner.breaker.errors()
    }

    /// Publishes the client's metrics to its sink under
    /// `<name>-dns-lookup`, `<name>-tcp-connection`, `<name>-tls-handshake`,
    /// `<name>-get-connection`, `<name>-write-request`, `<name>-get-response`
    /// and `<name>-outofservice`.
    ///
    /// Only the first call has an effect. If it is never called, the first
    /// request does it.
    pub fn publish_metrics(&self) {
        self.ensure_metrics();
    }

    /// The client's counters, published on first access.
    pub fn metrics(&self) -> Arc<Metrics> {
        self.ensure_metrics()
    }

    fn ensure_metrics(&self) -> Arc<Metrics> {
        let inner = &self.inner;
        Arc::clone(inner.metrics.get_or_init(|| {
            let metrics = Arc::new(Metrics::new());
            metrics.publish(&inner.name, inner.metric_sink.as_ref());
            metrics
        }))
    }

    /// Sends a request and returns the transport's response.
    ///
    /// Responses with a server error status are returned as `Ok`; they only
    /// count as failures for the breaker.
    pub fn execute(&self, mut request: Request<Body>) -> ClientResult<Response<Body>> {
        let inner = &self.inner;

        if !inner.breaker.is_servable() {
            tracing::debug!(client = %inner.name, uri = %request.uri(), "Out of service, request not sent");
            inner.hooks.execute_rejected_hook();
            return Err(Error::OutOfService);
        }

        let metrics = self.ensure_metrics();
        ClientTrace::new(Arc::clone(&metrics)).attach(&mut request);

        let outcome = inner.transport.send(request);

        if inner.policy.is_failure(&outcome) {
            self.on_failure(&metrics);
        } else {
            inner.breaker.record_success();
            inner.hooks.execute_success_hook();
        }

        outcome.map_err(Error::Transport)
    }

    fn on_failure(&self, metrics: &Metrics) {
        let inner = &self.inner;
        inner.hooks.execute_failure_hook();

        if !inner.breaker.record_failure() {
            return;
        }

        metrics.out_of_service.incr(1);
        tracing::warn!(
            client = %inner.name,
            max_errors = inner.breaker.threshold(),
            healing_time = ?inner.healing_time,
            "Too many consecutive errors, client out of service"
        );
        inner
            .hooks
            .execute_state_transition_hook(State::OutOfService);

        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        inner.scheduler.schedule(
            inner.healing_time,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.breaker.reset();
                    tracing::info!(client = %inner.name, "Client back in service");
                    inner.hooks.execute_state_transition_hook(State::InService);
                }
            }),
        );
    }

    /// Issues a GET to the specified URL.
    pub fn get(&self, url: &str) -> ClientResult<Response<Body>> {
        self.execute(Request::get(url).body(Body::new())?)
    }

    /// Issues a HEAD to the specified URL.
    pub fn head(&self, url: &str) -> ClientResult<Response<Body>> {
        self.execute(Request::head(url).body(Body::new())?)
    }

    /// Issues a POST to the specified URL.
    pub fn post(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<Body>,
    ) -> ClientResult<Response<Body>> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(url)
            .header(CONTENT_TYPE, content_type)
            .body(body.into())?;

        self.execute(request)
    }

    /// Issues a POST to the specified URL, with `data`'s keys and values
    /// URL-encoded as the request body.
    pub fn post_form<I, K, V>(&self, url: &str, data: I) -> ClientResult<Response<Body>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(data)
            .finish();

        self.post(url, "application/x-www-form-urlencoded", body)
    }
}

impl std::fmt::Debug for TimedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedClient")
            .field("name", &self.inner.name)
            .field("max_errors", &self.inner.breaker.threshold())
            .field("healing_time", &self.inner.healing_time)
            .field("state", &self.state())
            .finish()
    }
}
