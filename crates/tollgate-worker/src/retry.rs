use serde::{Deserialize, Serialize};

/// Requeue policy for failed jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures tolerated before a job is dead-lettered.
    pub max_retries: u32,
    /// Base delay in milliseconds before a requeue.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 200,
            backoff_max_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that requeues without delay.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    /// Whether a job that has now failed `failure_count` times goes back on
    /// its topic.
    pub fn should_retry(&self, failure_count: u32, retryable: bool) -> bool {
        retryable && failure_count <= self.max_retries
    }

    /// Delay before the requeue following failure number `failure_count`.
    pub fn backoff_ms(&self, failure_count: u32) -> u64 {
        let attempt = failure_count.saturating_sub(1);
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        delay.min(self.backoff_max_ms)
    }
}
