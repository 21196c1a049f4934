use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;

/// Last known state of a route's consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerState {
    Running,
    /// The broker closed the consumer. Nothing restarts it; this is the
    /// signal an operator or outer supervisor acts on.
    Closed { reason: String },
}

/// Route → consumer state, observable from outside the supervisor.
///
/// Backed by a `watch` channel so a health endpoint can read the current map
/// and a supervisor can `await` the next change. Clone freely; all clones
/// share one map.
#[derive(Clone)]
pub struct ConsumerHealth {
    tx: Arc<watch::Sender<BTreeMap<String, ConsumerState>>>,
}

impl Default for ConsumerHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerHealth {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BTreeMap::new());
        Self { tx: Arc::new(tx) }
    }

    pub fn mark_running(&self, route: &str) {
        self.set(route, ConsumerState::Running);
    }

    pub fn mark_closed(&self, route: &str, reason: impl Into<String>) {
        self.set(
            route,
            ConsumerState::Closed {
                reason: reason.into(),
            },
        );
    }

    fn set(&self, route: &str, state: ConsumerState) {
        self.tx.send_modify(|routes| {
            routes.insert(route.to_string(), state);
        });
    }

    pub fn state(&self, route: &str) -> Option<ConsumerState> {
        self.tx.borrow().get(route).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, ConsumerState> {
        self.tx.borrow().clone()
    }

    /// Routes whose consumer is no longer running.
    pub fn closed_routes(&self) -> Vec<String> {
        self.tx
            .borrow()
            .iter()
            .filter(|(_, state)| matches!(state, ConsumerState::Closed { .. }))
            .map(|(route, _)| route.clone())
            .collect()
    }

    /// `true` once at least one consumer is registered and none has closed.
    pub fn is_healthy(&self) -> bool {
        let routes = self.tx.borrow();
        !routes.is_empty() && routes.values().all(|s| *s == ConsumerState::Running)
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<String, ConsumerState>> {
        self.tx.subscribe()
    }
}
