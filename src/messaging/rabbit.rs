use std::future::Future;
use std::time::Duration;

use deadpool_lapin::Manager;
use lapin::ConnectionProperties;

/// Re-exported so other modules inside `messaging/` can import Pool from here.
pub type Pool = deadpool_lapin::Pool;

// ── Naming scheme ──────────────────────────────────────────────────────────────

/// One of the three stages every route's messages can sit in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    /// Live processing. Consumers read from this queue.
    Instant,
    /// Timed holding. Expired messages are dead-lettered back to `Instant`.
    Delay,
    /// Terminal sink for messages that used up their retry budget.
    DeadLetter,
}

impl Tier {
    /// Declaration order: `instant` must exist before `delay` points at it.
    pub const ALL: [Tier; 3] = [Tier::Instant, Tier::Delay, Tier::DeadLetter];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instant => "instant",
            Self::Delay => "delay",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Names end in `_{tier}_{kind}`. No tier label is an `_`-delimited suffix of
// another, so the tier (and therefore the route) can be read back from any
// name; distinct (route, tier) pairs never collide.

/// `{route}_{tier}_exchange`
pub fn exchange_name(route: &str, tier: Tier) -> String {
    format!("{route}_{tier}_exchange")
}

/// `{route}_{tier}_queue`
pub fn queue_name(route: &str, tier: Tier) -> String {
    format!("{route}_{tier}_queue")
}

/// Consumer tag for the route's instant-queue consumer.
pub fn consumer_tag(route: &str) -> String {
    format!("{}_retrier_ctag", queue_name(route, Tier::Instant))
}

/// Argument that makes the broker forward expired messages to another exchange.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// AMQP header mirroring [`crate::model::RetryEnvelope::retry_count`].
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

// ── Connection ─────────────────────────────────────────────────────────────────

/// Pause between full passes over the host list.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on session establishment when the caller does not supply one.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum RabbitError {
    /// No broker address was supplied.
    NoHosts,
    /// Could not establish a connection before the deadline.
    Timeout { after: Duration, last_error: String },
    /// Failed to build the connection pool itself.
    Pool(String),
    /// Startup was aborted by the shutdown signal.
    Cancelled,
}

impl std::fmt::Display for RabbitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoHosts => write!(f, "no RabbitMQ hosts configured"),
            Self::Timeout { after, last_error } => write!(
                f,
                "RabbitMQ connection failed within {}s: {last_error}",
                after.as_secs()
            ),
            Self::Pool(msg) => write!(f, "connection pool build failed: {msg}"),
            Self::Cancelled => write!(f, "connection attempt cancelled by shutdown"),
        }
    }
}

impl std::error::Error for RabbitError {}

// ── Pool constructor ───────────────────────────────────────────────────────────

/// Build a [`deadpool_lapin`] pool against the first reachable host.
///
/// Hosts are tried in order, each for at most its share of `timeout`; after a
/// full pass with no success the loop sleeps [`CONNECT_RETRY_INTERVAL`] and
/// starts over. The whole attempt is bounded by `timeout`, after which the
/// last connection error is reported.
pub async fn connect(
    hosts: &[String],
    max_connections: usize,
    timeout: Duration,
) -> Result<Pool, RabbitError> {
    if hosts.is_empty() {
        return Err(RabbitError::NoHosts);
    }

    let mut pools = hosts
        .iter()
        .map(|url| build_pool(url, max_connections))
        .collect::<Result<Vec<_>, _>>()?;

    let idx = first_reachable(&pools, timeout, |pool| {
        let pool = pool.clone();
        async move { pool.get().await.map(|_| ()).map_err(|e| e.to_string()) }
    })
    .await?;
    Ok(pools.swap_remove(idx))
}

/// Floor for a single host attempt, however many hosts share the timeout.
const MIN_HOST_ATTEMPT: Duration = Duration::from_secs(1);

fn per_host_timeout(timeout: Duration, hosts: usize) -> Duration {
    let hosts = u32::try_from(hosts.max(1)).unwrap_or(u32::MAX);
    (timeout / hosts).max(MIN_HOST_ATTEMPT)
}

/// Index of the first candidate `try_host` succeeds on.
async fn first_reachable<C, F, Fut>(
    candidates: &[C],
    timeout: Duration,
    mut try_host: F,
) -> Result<usize, RabbitError>
where
    F: FnMut(&C) -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let per_host = per_host_timeout(timeout, candidates.len());
    let mut last_error = String::from("no attempt completed");
    let attempt = async {
        loop {
            for (idx, candidate) in candidates.iter().enumerate() {
                match tokio::time::timeout(per_host, try_host(candidate)).await {
                    Ok(Ok(())) => {
                        tracing::info!(host = idx, "📡 RabbitMQ connected");
                        return idx;
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(host = idx, error = %e, "⚠️  RabbitMQ host not ready");
                        last_error = e;
                    }
                    Err(_) => {
                        tracing::warn!(host = idx, "⚠️  RabbitMQ host did not answer in time");
                        last_error = format!(
                            "host {idx} did not answer within {}ms",
                            per_host.as_millis()
                        );
                    }
                }
            }
            tracing::warn!(
                "⚠️  no RabbitMQ host reachable, retrying in {}s...",
                CONNECT_RETRY_INTERVAL.as_secs()
            );
            tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
        }
    };

    let outcome = tokio::time::timeout(timeout, attempt).await;
    match outcome {
        Ok(idx) => Ok(idx),
        Err(_) => Err(RabbitError::Timeout {
            after: timeout,
            last_error,
        }),
    }
}

fn build_pool(url: &str, max_connections: usize) -> Result<Pool, RabbitError> {
    let manager = Manager::new(url, ConnectionProperties::default());
    Pool::builder(manager)
        .max_size(max_connections)
        .build()
        .map_err(|e| RabbitError::Pool(e.to_string()))
}
