use crate::job::JobMessage;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tollgate_core::TollgateResult;

/// How a [`WorkerRunner`](crate::WorkerRunner) consumes one topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Topic to pull jobs from.
    pub topic: String,
    /// Maximum jobs processed at once.
    pub max_concurrency: usize,
    /// Sleep between polls when the topic is empty.
    pub poll_interval_ms: u64,
    /// Circuit breaker id; none disables the breaker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_id: Option<String>,
    /// Where jobs go once retries are exhausted.
    pub dead_letter_topic: String,
}

impl WorkerConfig {
    /// Defaults for `topic`: 4 concurrent jobs, 500 ms polls, `dead-letters`.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            max_concurrency: 4,
            poll_interval_ms: 500,
            circuit_id: None,
            dead_letter_topic: "dead-letters".to_string(),
        }
    }

    /// Set the concurrency bound (at least one).
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Guard the worker with a circuit breaker.
    pub fn with_circuit_id(mut self, id: impl Into<String>) -> Self {
        self.circuit_id = Some(id.into());
        self
    }

    /// Set the dead-letter topic.
    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = topic.into();
        self
    }
}

/// What a worker reports for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    /// Whether the job succeeded.
    pub success: bool,
    /// Worker-specific result data.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Error text when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Time spent processing.
    #[serde(default)]
    pub duration_ms: u64,
    /// Whether a failure may succeed on another attempt.
    #[serde(default)]
    pub retryable: bool,
}

impl ProcessOutcome {
    /// A successful outcome.
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            duration_ms: 0,
            retryable: false,
        }
    }

    /// A transient failure; the job is requeued while retries remain.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: serde_json::Value::Null,
            error: Some(error.into()),
            duration_ms: 0,
            retryable: true,
        }
    }

    /// A failure that will not improve on retry; dead-lettered at once.
    pub fn permanent_failure(error: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::failure(error)
        }
    }

    /// Record the processing time.
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// A job processor for one topic.
///
/// Returning `Err` is treated like a failed outcome classified by
/// [`TollgateError::is_retryable`](tollgate_core::TollgateError::is_retryable).
/// A panic inside `process` counts as a retryable failure.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Typed job body, decoded from the envelope payload.
    type Payload: DeserializeOwned + Send + 'static;

    /// Name used in logs.
    fn name(&self) -> &str;

    /// Process one job.
    async fn process(&self, payload: Self::Payload, job: &JobMessage)
        -> TollgateResult<ProcessOutcome>;
}
