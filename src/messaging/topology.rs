use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable},
    Channel, ExchangeKind,
};

use crate::config::RouteConfigs;

use super::rabbit::{exchange_name, queue_name, Tier, DEAD_LETTER_EXCHANGE_ARG};

// ── Error ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// Could not obtain a connection or channel to declare on.
    Channel(String),
    /// The broker rejected a declare or bind.
    Declare { entity: String, message: String },
    /// The entity exists with different arguments (PRECONDITION_FAILED).
    Conflict { entity: String, message: String },
}

impl std::fmt::Display for TopologyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(m) => write!(f, "topology channel error: {m}"),
            Self::Declare { entity, message } => {
                write!(f, "topology declaration failed for {entity}: {message}")
            }
            Self::Conflict { entity, message } => {
                write!(f, "{entity} already exists with different arguments: {message}")
            }
        }
    }
}

impl std::error::Error for TopologyError {}

impl TopologyError {
    fn from_lapin(entity: String, err: lapin::Error) -> Self {
        let conflict = matches!(
            &err,
            lapin::Error::ProtocolError(amqp)
                if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED))
        );
        if conflict {
            Self::Conflict {
                entity,
                message: err.to_string(),
            }
        } else {
            Self::Declare {
                entity,
                message: err.to_string(),
            }
        }
    }
}

// ── Topology entities ──────────────────────────────────────────────────────────

/// Extra declaration arguments. Only the delay tier sets any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueueArguments {
    /// Exchange the broker forwards expired messages to.
    pub dead_letter_exchange: Option<String>,
}

impl QueueArguments {
    pub fn for_tier(route: &str, tier: Tier) -> Self {
        match tier {
            Tier::Delay => Self {
                dead_letter_exchange: Some(exchange_name(route, Tier::Instant)),
            },
            Tier::Instant | Tier::DeadLetter => Self::default(),
        }
    }

    pub fn to_field_table(&self) -> FieldTable {
        let mut table = FieldTable::default();
        if let Some(dlx) = &self.dead_letter_exchange {
            table.insert(
                DEAD_LETTER_EXCHANGE_ARG.into(),
                AMQPValue::LongString(dlx.as_bytes().to_vec().into()),
            );
        }
        table
    }
}

/// Fanout, durable exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeSpec {
    pub name: String,
}

/// Durable, non-exclusive, non-auto-delete queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueSpec {
    pub name: String,
    pub arguments: QueueArguments,
}

/// Queue ← exchange with an empty routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub arguments: QueueArguments,
}

/// Everything declared for one (route, tier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTopology {
    pub exchange: ExchangeSpec,
    pub queue: QueueSpec,
    pub binding: Binding,
}

impl TierTopology {
    pub fn new(route: &str, tier: Tier) -> Self {
        let exchange = exchange_name(route, tier);
        let queue = queue_name(route, tier);
        let arguments = QueueArguments::for_tier(route, tier);
        Self {
            exchange: ExchangeSpec {
                name: exchange.clone(),
            },
            queue: QueueSpec {
                name: queue.clone(),
                arguments: arguments.clone(),
            },
            binding: Binding {
                queue,
                exchange,
                arguments,
            },
        }
    }
}

// ── Broker seam ────────────────────────────────────────────────────────────────

/// The three broker operations provisioning needs.
///
/// Implemented for [`lapin::Channel`]. Declarations must be idempotent for
/// identical arguments and fail with [`TopologyError::Conflict`] otherwise.
#[async_trait]
pub trait TopologyChannel: Send + Sync {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TopologyError>;
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), TopologyError>;
    async fn bind_queue(&self, binding: &Binding) -> Result<(), TopologyError>;
}

#[async_trait]
impl TopologyChannel for Channel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TopologyError> {
        self.exchange_declare(
            &exchange.name,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| TopologyError::from_lapin(format!("exchange '{}'", exchange.name), e))
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), TopologyError> {
        self.queue_declare(
            &queue.name,
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..Default::default()
            },
            queue.arguments.to_field_table(),
        )
        .await
        .map(|_| ())
        .map_err(|e| TopologyError::from_lapin(format!("queue '{}'", queue.name), e))
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), TopologyError> {
        self.queue_bind(
            &binding.queue,
            &binding.exchange,
            "",
            QueueBindOptions::default(),
            binding.arguments.to_field_table(),
        )
        .await
        .map_err(|e| {
            TopologyError::from_lapin(
                format!("binding '{}' → '{}'", binding.queue, binding.exchange),
                e,
            )
        })
    }
}

// ── Provisioning ───────────────────────────────────────────────────────────────

/// Declare the instant, delay and dead-letter exchange/queue/binding for every
/// route, route by route in name order.
///
/// The first failure aborts the call; whatever was already declared stays on
/// the broker. Re-running with the same routes is a no-op on the broker side.
pub async fn provision<C>(channel: &C, routes: &RouteConfigs) -> Result<(), TopologyError>
where
    C: TopologyChannel + ?Sized,
{
    for route in routes.names() {
        for tier in Tier::ALL {
            let topology = TierTopology::new(route, tier);
            channel.declare_exchange(&topology.exchange).await?;
            channel.declare_queue(&topology.queue).await?;
            channel.bind_queue(&topology.binding).await?;
            tracing::debug!(route, %tier, queue = %topology.queue.name, "tier declared");
        }
        tracing::info!(route, "🧱 retry topology ready");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::config::RouteConfig;

    /// In-memory stand-in for the broker's declare/bind semantics.
    #[derive(Default)]
    struct MemoryTopology {
        state: Mutex<State>,
        fail_on: Option<String>,
    }

    #[derive(Default, Clone, PartialEq, Eq, Debug)]
    struct State {
        exchanges: BTreeSet<String>,
        queues: BTreeMap<String, QueueArguments>,
        bindings: BTreeSet<(String, String)>,
        calls: Vec<String>,
    }

    impl MemoryTopology {
        fn failing_on(entity: &str) -> Self {
            Self {
                fail_on: Some(entity.to_string()),
                ..Default::default()
            }
        }

        fn with_queue(name: &str, arguments: QueueArguments) -> Self {
            let topology = Self::default();
            topology
                .state
                .lock()
                .unwrap()
                .queues
                .insert(name.to_string(), arguments);
            topology
        }

        fn snapshot(&self) -> State {
            self.state.lock().unwrap().clone()
        }

        fn check(&self, entity: &str) -> Result<(), TopologyError> {
            match &self.fail_on {
                Some(name) if name == entity => Err(TopologyError::Declare {
                    entity: entity.to_string(),
                    message: "connection reset".to_string(),
                }),
                _ => Ok(()),
            }
        }
    }

    #[async_trait]
    impl TopologyChannel for MemoryTopology {
        async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TopologyError> {
            self.check(&exchange.name)?;
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("exchange {}", exchange.name));
            state.exchanges.insert(exchange.name.clone());
            Ok(())
        }

        async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), TopologyError> {
            self.check(&queue.name)?;
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("queue {}", queue.name));
            match state.queues.get(&queue.name) {
                Some(existing) if *existing != queue.arguments => Err(TopologyError::Conflict {
                    entity: format!("queue '{}'", queue.name),
                    message: "PRECONDITION_FAILED - inequivalent arg".to_string(),
                }),
                _ => {
                    state
                        .queues
                        .insert(queue.name.clone(), queue.arguments.clone());
                    Ok(())
                }
            }
        }

        async fn bind_queue(&self, binding: &Binding) -> Result<(), TopologyError> {
            let mut state = self.state.lock().unwrap();
            state
                .calls
                .push(format!("bind {} {}", binding.queue, binding.exchange));
            state
                .bindings
                .insert((binding.queue.clone(), binding.exchange.clone()));
            Ok(())
        }
    }

    fn routes(names: &[&str]) -> RouteConfigs {
        names.iter().fold(RouteConfigs::new(), |acc, name| {
            acc.with_route(*name, RouteConfig::new(2, Duration::from_millis(200)))
        })
    }

    #[tokio::test]
    async fn declares_three_tiers_per_route_in_order() {
        let broker = MemoryTopology::default();
        provision(&broker, &routes(&["orders"])).await.unwrap();

        let state = broker.snapshot();
        assert_eq!(
            state.calls,
            vec![
                "exchange orders_instant_exchange",
                "queue orders_instant_queue",
                "bind orders_instant_queue orders_instant_exchange",
                "exchange orders_delay_exchange",
                "queue orders_delay_queue",
                "bind orders_delay_queue orders_delay_exchange",
                "exchange orders_dead_letter_exchange",
                "queue orders_dead_letter_queue",
                "bind orders_dead_letter_queue orders_dead_letter_exchange",
            ]
        );
    }

    #[tokio::test]
    async fn only_delay_queue_dead_letters_to_instant_exchange() {
        let broker = MemoryTopology::default();
        provision(&broker, &routes(&["orders"])).await.unwrap();

        let state = broker.snapshot();
        assert_eq!(
            state.queues["orders_delay_queue"].dead_letter_exchange.as_deref(),
            Some("orders_instant_exchange")
        );
        assert_eq!(state.queues["orders_instant_queue"], QueueArguments::default());
        assert_eq!(state.queues["orders_dead_letter_queue"], QueueArguments::default());
    }

    #[tokio::test]
    async fn two_routes_give_six_distinct_exchanges_and_queues() {
        let broker = MemoryTopology::default();
        provision(&broker, &routes(&["a", "b"])).await.unwrap();

        let state = broker.snapshot();
        assert_eq!(state.exchanges.len(), 6);
        assert_eq!(state.queues.len(), 6);
        assert_eq!(state.bindings.len(), 6);
    }

    #[tokio::test]
    async fn provisioning_twice_is_idempotent() {
        let broker = MemoryTopology::default();
        let table = routes(&["a", "b"]);

        provision(&broker, &table).await.unwrap();
        let first = broker.snapshot();
        provision(&broker, &table).await.unwrap();
        let second = broker.snapshot();

        assert_eq!(first.exchanges, second.exchanges);
        assert_eq!(first.queues, second.queues);
        assert_eq!(first.bindings, second.bindings);
    }

    #[tokio::test]
    async fn failure_aborts_and_leaves_partial_topology() {
        let broker = MemoryTopology::failing_on("orders_delay_queue");
        let err = provision(&broker, &routes(&["orders"])).await.unwrap_err();

        assert!(matches!(err, TopologyError::Declare { .. }));
        let state = broker.snapshot();
        assert!(state.queues.contains_key("orders_instant_queue"));
        assert!(state.exchanges.contains("orders_delay_exchange"));
        assert!(!state.exchanges.contains("orders_dead_letter_exchange"));
    }

    #[tokio::test]
    async fn changed_arguments_surface_a_conflict() {
        let broker = MemoryTopology::with_queue("orders_delay_queue", QueueArguments::default());
        let err = provision(&broker, &routes(&["orders"])).await.unwrap_err();
        assert!(matches!(err, TopologyError::Conflict { .. }), "{err}");
    }

    #[test]
    fn delay_arguments_render_as_field_table() {
        let table = QueueArguments::for_tier("orders", Tier::Delay).to_field_table();
        let key: lapin::types::ShortString = DEAD_LETTER_EXCHANGE_ARG.into();
        let value = table.inner().get(&key).cloned();
        assert_eq!(
            value,
            Some(AMQPValue::LongString(
                b"orders_instant_exchange".to_vec().into()
            ))
        );
        assert!(QueueArguments::for_tier("orders", Tier::Instant)
            .to_field_table()
            .inner()
            .is_empty());
    }
}
