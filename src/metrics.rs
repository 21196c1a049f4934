use std::sync::atomic::{AtomicU64, Ordering};

/// Retry-path counters.
///
/// All counters use `Relaxed` ordering; they are independent observations.
/// Share via `Arc<Metrics>`.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Deliveries handed to a handler by a route consumer.
    pub received: AtomicU64,

    /// Handler outcomes that were [`crate::model::ProcessStatus::Completed`].
    pub completed: AtomicU64,

    /// Handler outcomes that asked for a retry.
    pub retry_requested: AtomicU64,

    /// Retries published to a delay queue.
    pub delayed: AtomicU64,

    /// Messages published to a dead-letter queue.
    pub dead_lettered: AtomicU64,

    /// Retries that could not be routed or published. These messages left the
    /// retry path.
    pub retry_failed: AtomicU64,

    /// Route consumers the broker closed.
    pub consumers_closed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retry_requested(&self) {
        self.retry_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_delayed(&self) {
        self.delayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retry_failed(&self) {
        self.retry_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_consumers_closed(&self) {
        self.consumers_closed.fetch_add(1, Ordering::Relaxed);
    }

    // ── Snapshot ──────────────────────────────────────────────────────────────

    /// Approximate point-in-time view of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received:         self.received.load(Ordering::Relaxed),
            completed:        self.completed.load(Ordering::Relaxed),
            retry_requested:  self.retry_requested.load(Ordering::Relaxed),
            delayed:          self.delayed.load(Ordering::Relaxed),
            dead_lettered:    self.dead_lettered.load(Ordering::Relaxed),
            retry_failed:     self.retry_failed.load(Ordering::Relaxed),
            consumers_closed: self.consumers_closed.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        tracing::info!(
            received         = s.received,
            completed        = s.completed,
            retry_requested  = s.retry_requested,
            delayed          = s.delayed,
            dead_lettered    = s.dead_lettered,
            retry_failed     = s.retry_failed,
            consumers_closed = s.consumers_closed,
            "📊 metrics summary"
        );
    }
}

/// A point-in-time snapshot of [`Metrics`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub completed: u64,
    pub retry_requested: u64,
    pub delayed: u64,
    pub dead_lettered: u64,
    pub retry_failed: u64,
    pub consumers_closed: u64,
}
