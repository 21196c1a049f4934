use std::time::Duration;

use crate::config::RouteConfig;
use crate::messaging::Tier;
use crate::model::RetryEnvelope;

// ── Decision ───────────────────────────────────────────────────────────────────

/// What to do with a message whose handler asked for a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Park the message on the route's delay queue. The broker expires it after
    /// `ttl` and dead-letters it back onto the instant exchange.
    Delay {
        ttl: Duration,
        /// Envelope to publish, with `retry_count` already incremented.
        next: RetryEnvelope,
    },

    /// Budget exhausted. The envelope is published to the dead-letter tier
    /// as it is; its `retry_count` is not touched.
    DeadLetter { envelope: RetryEnvelope },
}

impl RetryDecision {
    pub fn target_tier(&self) -> Tier {
        match self {
            Self::Delay { .. } => Tier::Delay,
            Self::DeadLetter { .. } => Tier::DeadLetter,
        }
    }

    /// Per-message expiration. Only set for the delay tier.
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            Self::Delay { ttl, .. } => Some(*ttl),
            Self::DeadLetter { .. } => None,
        }
    }

    pub fn envelope(&self) -> &RetryEnvelope {
        match self {
            Self::Delay { next, .. } => next,
            Self::DeadLetter { envelope } => envelope,
        }
    }

    pub fn into_envelope(self) -> RetryEnvelope {
        match self {
            Self::Delay { next, .. } => next,
            Self::DeadLetter { envelope } => envelope,
        }
    }
}

// ── Policy ─────────────────────────────────────────────────────────────────────

/// Decide where a failed message goes next.
///
/// `envelope.retry_count` is the number of delay round-trips the message has
/// already made (0 = first attempt). The comparison is `>=`, so a route with
/// `max_retry_count = 2` sees the message three times: two delays, then the
/// third failure dead-letters it.
///
/// Pure: no I/O, same inputs give the same decision.
pub fn decide(envelope: &RetryEnvelope, route: &RouteConfig) -> RetryDecision {
    if envelope.retry_count >= route.max_retry_count {
        RetryDecision::DeadLetter {
            envelope: envelope.clone(),
        }
    } else {
        let mut next = envelope.clone();
        next.retry_count = envelope.retry_count.saturating_add(1);
        RetryDecision::Delay {
            ttl: route.delay_expiration,
            next,
        }
    }
}

/// Delay round-trips left for a message at `retry_count`. Saturates at `0`.
#[inline]
pub fn attempts_remaining(route: &RouteConfig, retry_count: u32) -> u32 {
    route.max_retry_count.saturating_sub(retry_count)
}

/// `ttl` in whole milliseconds, saturating at `u64::MAX`.
pub fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}
