use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel,
};

use crate::model::{encode, RetryEnvelope};

use super::rabbit::{exchange_name, Pool, Tier, RETRY_COUNT_HEADER};

// ── Error ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    Connection(String),
    Channel(String),
    Serialize(String),
    Publish(String),
    /// The broker refused the message (negative publisher confirm).
    Nacked { exchange: String },
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(m) => write!(f, "publisher connection error: {m}"),
            Self::Channel(m) => write!(f, "publisher channel error: {m}"),
            Self::Serialize(m) => write!(f, "serialization failed: {m}"),
            Self::Publish(m) => write!(f, "publish failed: {m}"),
            Self::Nacked { exchange } => write!(f, "broker nacked publish to '{exchange}'"),
        }
    }
}

impl std::error::Error for PublishError {}

// ── Publisher seam ─────────────────────────────────────────────────────────────

/// Sends an envelope to one tier of a route.
///
/// `ttl` is only meaningful for [`Tier::Delay`]; implementations leave the
/// message expiration unset otherwise.
#[async_trait]
pub trait RetryPublisher: Send + Sync {
    async fn publish(
        &self,
        route: &str,
        envelope: &RetryEnvelope,
        tier: Tier,
        ttl: Option<Duration>,
    ) -> Result<(), PublishError>;
}

// ── PublisherSession ───────────────────────────────────────────────────────────

/// Long-lived publish-side session.
///
/// Wraps the publisher's own connection pool. Cloning is cheap (the pool is
/// `Arc`-backed) and every clone shares the same connections. Each publish
/// takes a pooled connection, opens a dedicated confirm-mode channel, and
/// closes it again on every path, so concurrent retries never share a channel
/// and never hold a lock across the session's lifetime.
#[derive(Clone)]
pub struct PublisherSession {
    pool: Pool,
}

impl PublisherSession {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open a plain channel on the session, e.g. for topology declarations.
    pub async fn channel(&self) -> Result<Channel, PublishError> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| PublishError::Connection(e.to_string()))?;

        // conn (pool Object) goes back to the pool here; the channel's
        // Arc<Connection> keeps the TCP connection alive.
        conn.create_channel()
            .await
            .map_err(|e| PublishError::Channel(e.to_string()))
    }

    async fn publish_on(
        channel: &Channel,
        exchange: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), PublishError> {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| PublishError::Channel(e.to_string()))?;

        let confirmation = channel
            .basic_publish(exchange, "", BasicPublishOptions::default(), body, properties)
            .await
            .map_err(|e| PublishError::Publish(e.to_string()))?
            .await
            .map_err(|e| PublishError::Publish(e.to_string()))?;

        match confirmation {
            Confirmation::Nack(_) => Err(PublishError::Nacked {
                exchange: exchange.to_string(),
            }),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }
}

#[async_trait]
impl RetryPublisher for PublisherSession {
    async fn publish(
        &self,
        route: &str,
        envelope: &RetryEnvelope,
        tier: Tier,
        ttl: Option<Duration>,
    ) -> Result<(), PublishError> {
        let body = encode(envelope).map_err(|e| PublishError::Serialize(e.to_string()))?;
        let exchange = exchange_name(route, tier);
        let properties = message_properties(envelope, tier, ttl);

        let channel = self.channel().await?;
        let outcome = Self::publish_on(&channel, &exchange, &body, properties).await;

        if let Err(e) = channel.close(200, "publish done").await {
            tracing::debug!(error = %e, exchange = %exchange, "publish channel close failed");
        }

        outcome
    }
}

/// Persistent JSON message carrying the original headers plus
/// [`RETRY_COUNT_HEADER`]. Expiration is set for the delay tier only.
fn message_properties(envelope: &RetryEnvelope, tier: Tier, ttl: Option<Duration>) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (key, value) in &envelope.headers {
        headers.insert(
            key.as_str().into(),
            AMQPValue::LongString(value.as_bytes().to_vec().into()),
        );
    }
    headers.insert(
        RETRY_COUNT_HEADER.into(),
        AMQPValue::LongInt(i32::try_from(envelope.retry_count).unwrap_or(i32::MAX)),
    );

    let props = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2)
        .with_headers(headers);

    match (tier, ttl) {
        (Tier::Delay, Some(ttl)) => props.with_expiration(ttl.as_millis().to_string().into()),
        _ => props,
    }
}
