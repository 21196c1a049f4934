use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{RouteConfigs, DEFAULT_PREFETCH};
use crate::handler::Handler;
use crate::health::ConsumerHealth;
use crate::messaging::{
    connect, provision, ConsumerError, ConsumerSupervisor, PublishError, PublisherSession,
    RabbitError, RetryPublisher, Tier, TopologyError, DEFAULT_CONNECT_TIMEOUT,
};
use crate::metrics::Metrics;
use crate::model::{Event, ProcessStatus, RetryEnvelope, HEADER_MESSAGE_ROUTE};
use crate::retry::{attempts_remaining, decide, ttl_millis, RetryDecision};
use crate::shutdown::ShutdownSignal;

// ── Errors ─────────────────────────────────────────────────────────────────────

/// Why a single retry could not be issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// `retry` was called before [`Retrier::run_publisher`] completed.
    PublisherNotRunning,
    /// The event has no [`HEADER_MESSAGE_ROUTE`] header.
    MissingRouteHeader,
    /// The route header names a route that is not configured.
    UnknownRoute(String),
    Publish(PublishError),
}

impl std::fmt::Display for RetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PublisherNotRunning => {
                write!(f, "publisher not running: call `run_publisher` before retrying")
            }
            Self::MissingRouteHeader => write!(f, "event has no '{HEADER_MESSAGE_ROUTE}' header"),
            Self::UnknownRoute(route) => write!(f, "no retry config for route '{route}'"),
            Self::Publish(e) => write!(f, "retry publish failed: {e}"),
        }
    }
}

impl std::error::Error for RetryError {}

/// Errors from starting the publisher session.
#[derive(Debug)]
pub enum StartupError {
    Connect(RabbitError),
    Channel(PublishError),
    Topology(TopologyError),
    Consumer(ConsumerError),
    /// The shutdown signal fired before startup finished.
    Cancelled,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "{e}"),
            Self::Channel(e) => write!(f, "{e}"),
            Self::Topology(e) => write!(f, "{e}"),
            Self::Consumer(e) => write!(f, "{e}"),
            Self::Cancelled => write!(f, "startup cancelled by shutdown signal"),
        }
    }
}

impl std::error::Error for StartupError {}

// ── Retrier ────────────────────────────────────────────────────────────────────

/// Owns the retry path for a set of routes.
///
/// # Lifecycle
/// 1. [`Retrier::run_publisher`] connects the publish-side session and
///    declares each route's instant / delay / dead-letter topology.
/// 2. [`Retrier::wrap`] puts a [`RetryMiddleware`] around the handler.
/// 3. [`Retrier::run_consumers`] opens a separate consume-side session and
///    starts one consumer per route on its instant queue.
///
/// Share as `Arc<Retrier>`.
pub struct Retrier {
    hosts: Vec<String>,
    routes: Arc<RouteConfigs>,
    connect_timeout: Duration,
    pool_size: usize,
    prefetch_count: u16,
    publisher: OnceLock<Arc<dyn RetryPublisher>>,
    health: ConsumerHealth,
    metrics: Arc<Metrics>,
}

impl Retrier {
    pub fn new(hosts: Vec<String>, routes: RouteConfigs) -> Self {
        Self {
            hosts,
            routes: Arc::new(routes),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_size: 4,
            prefetch_count: DEFAULT_PREFETCH,
            publisher: OnceLock::new(),
            health: ConsumerHealth::new(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn routes(&self) -> &RouteConfigs {
        &self.routes
    }

    pub fn health(&self) -> &ConsumerHealth {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn is_publisher_running(&self) -> bool {
        self.publisher.get().is_some()
    }

    /// Connect the publisher session and provision the topology.
    ///
    /// Connecting is bounded by the connect timeout. `shutdown` aborts the
    /// whole sequence. Calling this twice keeps the first session.
    pub async fn run_publisher(&self, mut shutdown: ShutdownSignal) -> Result<(), StartupError> {
        tracing::info!(hosts = self.hosts.len(), "🔌 dialing rabbitmq server");

        let startup = async {
            let pool = connect(&self.hosts, self.pool_size, self.connect_timeout)
                .await
                .map_err(StartupError::Connect)?;
            let session = PublisherSession::new(pool);

            let channel = session.channel().await.map_err(StartupError::Channel)?;
            let provisioned = provision(&channel, &self.routes).await;
            if let Err(e) = channel.close(200, "topology declared").await {
                tracing::debug!(error = %e, "topology channel close failed");
            }
            provisioned.map_err(StartupError::Topology)?;

            Ok::<_, StartupError>(session)
        };

        let session = tokio::select! {
            biased;
            _ = shutdown.wait() => return Err(StartupError::Cancelled),
            session = startup => session?,
        };

        self.install_publisher(Arc::new(session));
        tracing::info!(routes = self.routes.len(), "✅ retry publisher ready");
        Ok(())
    }

    /// Use `publisher` for retries. Ignored if one is already installed.
    pub fn install_publisher(&self, publisher: Arc<dyn RetryPublisher>) {
        if self.publisher.set(publisher).is_err() {
            tracing::warn!("retry publisher already running, keeping the existing one");
        }
    }

    /// Start one consumer per route, each on its own consume-side session.
    ///
    /// `shutdown` aborts startup; once this returns the consumers run until
    /// the broker closes them.
    pub async fn run_consumers(
        &self,
        handler: Arc<dyn Handler>,
        mut shutdown: ShutdownSignal,
    ) -> Result<ConsumerSupervisor, StartupError> {
        let startup = async {
            let pool = connect(&self.hosts, self.routes.len().max(1), self.connect_timeout)
                .await
                .map_err(StartupError::Connect)?;
            ConsumerSupervisor::start(
                pool,
                &self.routes,
                handler,
                self.prefetch_count,
                self.health.clone(),
                Arc::clone(&self.metrics),
            )
            .await
            .map_err(StartupError::Consumer)
        };

        tokio::select! {
            biased;
            _ = shutdown.wait() => Err(StartupError::Cancelled),
            supervisor = startup => supervisor,
        }
    }

    /// Wrap `handler` so retry requests are routed through the delay and
    /// dead-letter tiers.
    ///
    /// Fails with [`RetryError::PublisherNotRunning`] if the publisher has not
    /// been started yet.
    pub fn wrap<H: Handler>(self: &Arc<Self>, handler: H) -> Result<RetryMiddleware<H>, RetryError> {
        if !self.is_publisher_running() {
            return Err(RetryError::PublisherNotRunning);
        }
        Ok(RetryMiddleware {
            retrier: Arc::clone(self),
            inner: handler,
        })
    }

    /// Send `event` one step along its route's escalation path.
    ///
    /// Returns the tier the message was published to.
    pub async fn retry(&self, event: &dyn Event) -> Result<Tier, RetryError> {
        let publisher = self.publisher.get().ok_or(RetryError::PublisherNotRunning)?;

        let route = event.route().ok_or(RetryError::MissingRouteHeader)?;
        let config = self
            .routes
            .get(route)
            .ok_or_else(|| RetryError::UnknownRoute(route.to_string()))?;

        let decision = decide(&RetryEnvelope::from_event(event), config);
        let tier = decision.target_tier();
        publisher
            .publish(route, decision.envelope(), tier, decision.ttl())
            .await
            .map_err(RetryError::Publish)?;

        match &decision {
            RetryDecision::Delay { ttl, next } => {
                self.metrics.inc_delayed();
                tracing::info!(
                    route,
                    retry_count = next.retry_count,
                    remaining = attempts_remaining(config, next.retry_count),
                    ttl_ms = ttl_millis(*ttl),
                    "🔄 message delayed for retry"
                );
            }
            RetryDecision::DeadLetter { envelope } => {
                self.metrics.inc_dead_lettered();
                tracing::warn!(
                    route,
                    retry_count = envelope.retry_count,
                    "☠️  retry budget exhausted, message dead-lettered"
                );
            }
        }

        Ok(tier)
    }
}

// ── RetryMiddleware ────────────────────────────────────────────────────────────

/// Handler wrapper that acts on [`ProcessStatus::RetryRequested`].
///
/// The inner handler's status is always returned unchanged. A retry that
/// cannot be issued is logged and counted, and the message leaves the retry
/// path; it is not escalated to the caller.
pub struct RetryMiddleware<H> {
    retrier: Arc<Retrier>,
    inner: H,
}

#[async_trait]
impl<H: Handler> Handler for RetryMiddleware<H> {
    async fn handle_event(&self, event: &dyn Event) -> ProcessStatus {
        let status = self.inner.handle_event(event).await;
        if status == ProcessStatus::RetryRequested {
            self.retrier.metrics.inc_retry_requested();
            if let Err(e) = self.retrier.retry(event).await {
                self.retrier.metrics.inc_retry_failed();
                tracing::error!(
                    route = event.route().unwrap_or("<none>"),
                    error = %e,
                    "error retrying message"
                );
            }
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::RouteConfig;
    use crate::handler::HandlerFn;
    use crate::model::Message;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Published {
        route: String,
        envelope: RetryEnvelope,
        tier: Tier,
        ttl: Option<Duration>,
    }

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<Published>>,
        fail: bool,
    }

    #[async_trait]
    impl RetryPublisher for RecordingPublisher {
        async fn publish(
            &self,
            route: &str,
            envelope: &RetryEnvelope,
            tier: Tier,
            ttl: Option<Duration>,
        ) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError::Publish("connection reset".to_string()));
            }
            self.published.lock().unwrap().push(Published {
                route: route.to_string(),
                envelope: envelope.clone(),
                tier,
                ttl,
            });
            Ok(())
        }
    }

    fn retrier_with(publisher: Arc<RecordingPublisher>) -> Arc<Retrier> {
        let routes = RouteConfigs::new()
            .with_route("orders", RouteConfig::new(2, Duration::from_millis(200)));
        let retrier = Retrier::new(vec!["amqp://localhost".to_string()], routes);
        retrier.install_publisher(publisher);
        Arc::new(retrier)
    }

    #[tokio::test]
    async fn retry_before_publisher_starts_fails_fast() {
        let routes = RouteConfigs::new()
            .with_route("orders", RouteConfig::new(2, Duration::from_millis(200)));
        let retrier = Arc::new(Retrier::new(vec![], routes));

        let msg = Message::new("x").with_route("orders");
        assert_eq!(
            retrier.retry(&msg).await.unwrap_err(),
            RetryError::PublisherNotRunning
        );
        assert!(matches!(
            retrier.wrap(HandlerFn(|_: &dyn Event| ProcessStatus::Completed)),
            Err(RetryError::PublisherNotRunning)
        ));
    }

    #[tokio::test]
    async fn missing_route_header_is_a_lookup_error() {
        let publisher = Arc::new(RecordingPublisher::default());
        let retrier = retrier_with(Arc::clone(&publisher));

        let err = retrier.retry(&Message::new("x")).await.unwrap_err();
        assert_eq!(err, RetryError::MissingRouteHeader);
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_route_is_a_lookup_error() {
        let publisher = Arc::new(RecordingPublisher::default());
        let retrier = retrier_with(Arc::clone(&publisher));

        let err = retrier
            .retry(&Message::new("x").with_route("payments"))
            .await
            .unwrap_err();
        assert_eq!(err, RetryError::UnknownRoute("payments".to_string()));
    }

    #[tokio::test]
    async fn orders_fail_three_times_then_dead_letter() {
        let publisher = Arc::new(RecordingPublisher::default());
        let retrier = retrier_with(Arc::clone(&publisher));
        let handler = retrier
            .wrap(HandlerFn(|_: &dyn Event| ProcessStatus::RetryRequested))
            .unwrap();

        // First attempt arrives as a plain message; later ones are what the
        // broker forwards back from the delay queue.
        let first = Message::new("order #42").with_route("orders");
        assert_eq!(handler.handle_event(&first).await, ProcessStatus::RetryRequested);

        let second = publisher.published.lock().unwrap()[0].envelope.clone();
        assert_eq!(handler.handle_event(&second).await, ProcessStatus::RetryRequested);

        let third = publisher.published.lock().unwrap()[1].envelope.clone();
        assert_eq!(handler.handle_event(&third).await, ProcessStatus::RetryRequested);

        let published = publisher.published.lock().unwrap().clone();
        let steps: Vec<(Tier, Option<Duration>, u32)> = published
            .iter()
            .map(|p| (p.tier, p.ttl, p.envelope.retry_count))
            .collect();
        assert_eq!(
            steps,
            vec![
                (Tier::Delay, Some(Duration::from_millis(200)), 1),
                (Tier::Delay, Some(Duration::from_millis(200)), 2),
                (Tier::DeadLetter, None, 2),
            ]
        );
        assert!(published.iter().all(|p| p.route == "orders"));
        assert!(published.iter().all(|p| p.envelope.value == b"order #42"));

        let m = retrier.metrics().snapshot();
        assert_eq!(m.retry_requested, 3);
        assert_eq!(m.delayed, 2);
        assert_eq!(m.dead_lettered, 1);
        assert_eq!(m.retry_failed, 0);
    }

    #[tokio::test]
    async fn publish_failure_keeps_original_status() {
        let publisher = Arc::new(RecordingPublisher {
            fail: true,
            ..Default::default()
        });
        let retrier = retrier_with(publisher);
        let handler = retrier
            .wrap(HandlerFn(|_: &dyn Event| ProcessStatus::RetryRequested))
            .unwrap();

        let msg = Message::new("x").with_route("orders");
        assert_eq!(handler.handle_event(&msg).await, ProcessStatus::RetryRequested);
        assert_eq!(retrier.metrics().snapshot().retry_failed, 1);
    }

    #[tokio::test]
    async fn completed_events_are_not_republished() {
        let publisher = Arc::new(RecordingPublisher::default());
        let retrier = retrier_with(Arc::clone(&publisher));
        let handler = retrier
            .wrap(HandlerFn(|_: &dyn Event| ProcessStatus::Completed))
            .unwrap();

        let msg = Message::new("x").with_route("orders");
        assert_eq!(handler.handle_event(&msg).await, ProcessStatus::Completed);
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_startup_reports_cancellation() {
        let routes = RouteConfigs::new()
            .with_route("orders", RouteConfig::new(2, Duration::from_millis(200)));
        let retrier = Retrier::new(vec!["amqp://127.0.0.1:1".to_string()], routes);

        let (handle, signal) = crate::shutdown::new_pair();
        handle.trigger();

        let err = retrier.run_publisher(signal).await.unwrap_err();
        assert!(matches!(err, StartupError::Cancelled));
        assert!(!retrier.is_publisher_running());
    }
}
