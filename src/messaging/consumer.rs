use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions},
    types::{AMQPValue, FieldTable, ShortString},
};
use tokio::task::JoinHandle;

use crate::config::RouteConfigs;
use crate::handler::Handler;
use crate::health::ConsumerHealth;
use crate::metrics::Metrics;
use crate::model::{decode, Event, Headers, Message, ProcessStatus, RetryEnvelope};

use super::rabbit::{consumer_tag, queue_name, Pool, Tier, RETRY_COUNT_HEADER};

// ── Error ──────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConsumerError {
    Connection(String),
    Channel(String),
    Qos(String),
    Start { route: String, message: String },
}

impl std::fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(m) => write!(f, "consumer connection error: {m}"),
            Self::Channel(m) => write!(f, "consumer channel error: {m}"),
            Self::Qos(m) => write!(f, "QoS setup failed: {m}"),
            Self::Start { route, message } => {
                write!(f, "failed to start consuming route '{route}': {message}")
            }
        }
    }
}

impl std::error::Error for ConsumerError {}

// ── ConsumerSupervisor ─────────────────────────────────────────────────────────

/// One consumer per route, each on the route's instant queue.
///
/// Every consumer runs in its own task for as long as the broker keeps it
/// open. When the stream ends or errors the closure is logged, counted, and
/// recorded in [`ConsumerHealth`]; the consumer is **not** restarted.
pub struct ConsumerSupervisor {
    handles: Vec<(String, JoinHandle<()>)>,
    /// Consume-side session. Held so its connections outlive startup.
    _pool: Pool,
}

impl ConsumerSupervisor {
    /// Open one channel per route on `pool` and start consuming.
    ///
    /// Each route gets its own channel so a channel error on one route cannot
    /// take the others down. Fails on the first route that cannot be started;
    /// consumers already started keep running.
    pub async fn start(
        pool: Pool,
        routes: &RouteConfigs,
        handler: Arc<dyn Handler>,
        prefetch_count: u16,
        health: ConsumerHealth,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ConsumerError> {
        let mut handles = Vec::with_capacity(routes.len());

        for route in routes.names() {
            let conn = pool
                .get()
                .await
                .map_err(|e| ConsumerError::Connection(e.to_string()))?;

            let channel = conn
                .create_channel()
                .await
                .map_err(|e| ConsumerError::Channel(e.to_string()))?;

            channel
                .basic_qos(prefetch_count, BasicQosOptions { global: false })
                .await
                .map_err(|e| ConsumerError::Qos(e.to_string()))?;

            let queue = queue_name(route, Tier::Instant);
            let consumer = channel
                .basic_consume(
                    &queue,
                    &consumer_tag(route),
                    BasicConsumeOptions {
                        no_ack: false,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| ConsumerError::Start {
                    route: route.to_string(),
                    message: e.to_string(),
                })?;

            health.mark_running(route);
            tracing::info!(route, queue = %queue, prefetch = prefetch_count, "▶️  consuming");

            let task = consume_loop(
                route.to_string(),
                consumer,
                Arc::clone(&handler),
                health.clone(),
                Arc::clone(&metrics),
            );
            handles.push((route.to_string(), tokio::spawn(task)));
        }

        Ok(Self {
            handles,
            _pool: pool,
        })
    }

    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.handles.iter().map(|(route, _)| route.as_str())
    }

    /// Wait until every consumer has closed.
    pub async fn join(self) {
        for (route, handle) in self.handles {
            match handle.await {
                Err(e) if e.is_panic() => {
                    tracing::error!(route = %route, error = %e, "consumer task panicked");
                }
                _ => tracing::debug!(route = %route, "consumer task finished"),
            }
        }
    }

    /// Stop all consumer tasks without waiting for the broker.
    pub fn abort(&self) {
        for (_, handle) in &self.handles {
            handle.abort();
        }
    }
}

// ── Background task ────────────────────────────────────────────────────────────

/// What the consume loop needs from a broker delivery.
#[async_trait]
trait Inbound: Send + Sync {
    fn body(&self) -> &[u8];
    fn amqp_headers(&self) -> Option<&FieldTable>;
    async fn acknowledge(&self) -> Result<(), String>;
}

#[async_trait]
impl Inbound for Delivery {
    fn body(&self) -> &[u8] {
        &self.data
    }

    fn amqp_headers(&self) -> Option<&FieldTable> {
        self.properties.headers().as_ref()
    }

    async fn acknowledge(&self) -> Result<(), String> {
        self.ack(BasicAckOptions::default())
            .await
            .map_err(|e| e.to_string())
    }
}

/// Deliver each message to `handler`, then ack it.
///
/// Messages are handled one at a time, so a handler that never returns stalls
/// this route only. Returns once the stream ends or yields an error, after
/// the closure has been counted and recorded in `health`.
async fn consume_loop<S, D, E>(
    route: String,
    mut deliveries: S,
    handler: Arc<dyn Handler>,
    health: ConsumerHealth,
    metrics: Arc<Metrics>,
) where
    S: Stream<Item = Result<D, E>> + Unpin,
    D: Inbound,
    E: std::fmt::Display,
{
    let reason = loop {
        let delivery = match deliveries.next().await {
            Some(Ok(d)) => d,
            Some(Err(e)) => break e.to_string(),
            None => break "consumer stream ended".to_string(),
        };

        metrics.inc_received();
        let event = InboundEvent::from_parts(delivery.body(), delivery.amqp_headers());
        let status = handler.handle_event(event.as_event()).await;
        if status == ProcessStatus::Completed {
            metrics.inc_completed();
        }

        if let Err(e) = delivery.acknowledge().await {
            tracing::warn!(route = %route, error = %e, "ack failed");
        }
    };

    metrics.inc_consumers_closed();
    health.mark_closed(&route, reason.clone());
    tracing::error!(route = %route, reason = %reason, "consumer closed");
}

// ── Helpers ────────────────────────────────────────────────────────────────────

/// What a delivery body turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
enum InboundEvent {
    /// A message that came back through the delay queue.
    Retried(RetryEnvelope),
    /// Anything else is a first attempt.
    Fresh(Message),
}

impl InboundEvent {
    /// Only deliveries stamped with [`RETRY_COUNT_HEADER`] by the retry
    /// publisher are decoded as envelopes. A stamped body that fails to decode
    /// falls back to a first attempt.
    fn from_parts(body: &[u8], headers: Option<&FieldTable>) -> Self {
        let stamped = headers.is_some_and(|table| {
            table
                .inner()
                .contains_key(&ShortString::from(RETRY_COUNT_HEADER))
        });
        if stamped {
            match decode(body) {
                Ok(envelope) => return Self::Retried(envelope),
                Err(e) => {
                    tracing::debug!(error = %e, "stamped body is not a retry envelope, treating as first attempt");
                }
            }
        }
        Self::Fresh(Message {
            value: body.to_vec(),
            headers: headers.map(string_headers).unwrap_or_default(),
        })
    }

    fn as_event(&self) -> &dyn Event {
        match self {
            Self::Retried(envelope) => envelope,
            Self::Fresh(message) => message,
        }
    }
}

/// Keep the AMQP headers that carry text.
///
/// Long-string values are read as UTF-8 with invalid sequences replaced by
/// U+FFFD. Numeric, boolean, table and other non-text headers are not part of
/// [`Headers`] and are dropped.
fn string_headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), text))
        })
        .collect()
}
