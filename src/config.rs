use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for per-envelope publish attempts
///
/// Backoff grows exponentially: `base_backoff * 2^(attempt - 1)`, capped at
/// `max_backoff`. Only broker-reported transient errors are retried; permanent
/// errors fail the envelope immediately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of send attempts per envelope (including the first)
    pub max_attempts: u32,

    /// Backoff before the first retry
    pub base_backoff: Duration,

    /// Upper bound on any single backoff interval
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Backoff to apply before re-dispatching after the given failed attempt.
    ///
    /// `attempt` is the 1-based count of attempts made so far.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let candidate = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(exponent));
        candidate.min(self.max_backoff)
    }

    /// Whether another attempt is allowed after `attempts` tries
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Configuration for a batch publisher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Publisher ID; auto-generated when not set
    pub publisher_id: Option<String>,

    /// Concurrency cap on in-flight sends within one batch
    pub max_in_flight: usize,

    /// Default retry policy, overridable per request
    pub retry: RetryPolicy,

    /// Deadline for a single envelope to resolve, reset on retry
    pub per_message_timeout: Duration,

    /// Deadline for the whole batch; unresolved entries become TimedOut
    pub batch_deadline: Duration,

    /// How often the coordinator sweeps for expired entries
    pub sweep_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            publisher_id: None,
            max_in_flight: 16,
            retry: RetryPolicy::default(),
            per_message_timeout: Duration::from_secs(5),
            batch_deadline: Duration::from_secs(30),
            sweep_interval: Duration::from_millis(50),
        }
    }
}

/// Configuration for a consumer worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker ID; auto-generated when not set
    pub worker_id: Option<String>,

    /// Redeliveries attempted after the first handler failure.
    ///
    /// Once a message has failed `max_redeliveries + 1` handler invocations it
    /// is routed to the dead-letter sink and its offset is committed anyway,
    /// so one poison message cannot stall the partition. Callers that cannot
    /// accept that trade-off should raise this value and attach a durable
    /// dead-letter sink.
    pub max_redeliveries: u32,

    /// Pause between handler redeliveries of the same message
    pub redelivery_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            max_redeliveries: 3,
            redelivery_delay: Duration::ZERO,
        }
    }
}
