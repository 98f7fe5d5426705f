use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tollgate_core::{QueueMessage, TollgateError, TollgateResult};
use uuid::Uuid;

/// Envelope every job travels in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Stable job id; survives retries.
    pub job_id: String,
    /// Id shared by all jobs belonging to one logical request.
    pub correlation_id: String,
    /// Component that produced the job.
    pub source: String,
    /// Higher is more urgent. Advisory only.
    #[serde(default)]
    pub priority: i32,
    /// Worker-specific body.
    pub payload: serde_json::Value,
}

impl JobEnvelope {
    /// A new envelope with fresh job and correlation ids.
    pub fn new(source: impl Into<String>, payload: serde_json::Value) -> Self {
        let job_id = Uuid::new_v4().to_string();
        Self {
            correlation_id: job_id.clone(),
            job_id,
            source: source.into(),
            priority: 0,
            payload,
        }
    }

    /// Use a caller-chosen job id.
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }

    /// Attach the job to an existing correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Failure history carried in message attributes across retries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    /// Number of failed attempts so far.
    pub failure_count: u32,
    /// Time of the first failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failed_at: Option<DateTime<Utc>>,
    /// Time of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<DateTime<Utc>>,
    /// Error text of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl FailureContext {
    /// Attribute key for the failure count.
    pub const FAILURE_COUNT: &'static str = "failure_count";
    /// Attribute key for the first failure time.
    pub const FIRST_FAILED_AT: &'static str = "first_failed_at";
    /// Attribute key for the last failure time.
    pub const LAST_FAILED_AT: &'static str = "last_failed_at";
    /// Attribute key for the last error.
    pub const LAST_ERROR: &'static str = "last_error";

    /// Read the failure context from message attributes. Unparseable values
    /// are treated as absent.
    pub fn from_attributes(attributes: &HashMap<String, String>) -> Self {
        let time = |key: &str| {
            attributes
                .get(key)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc))
        };
        Self {
            failure_count: attributes
                .get(Self::FAILURE_COUNT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            first_failed_at: time(Self::FIRST_FAILED_AT),
            last_failed_at: time(Self::LAST_FAILED_AT),
            last_error: attributes.get(Self::LAST_ERROR).cloned(),
        }
    }

    /// Encode as message attributes. A clean context encodes to nothing.
    pub fn to_attributes(&self) -> HashMap<String, String> {
        let mut attributes = HashMap::new();
        if self.failure_count == 0 {
            return attributes;
        }
        attributes.insert(Self::FAILURE_COUNT.to_string(), self.failure_count.to_string());
        if let Some(t) = self.first_failed_at {
            attributes.insert(Self::FIRST_FAILED_AT.to_string(), t.to_rfc3339());
        }
        if let Some(t) = self.last_failed_at {
            attributes.insert(Self::LAST_FAILED_AT.to_string(), t.to_rfc3339());
        }
        if let Some(e) = &self.last_error {
            attributes.insert(Self::LAST_ERROR.to_string(), e.clone());
        }
        attributes
    }

    /// Record one more failure at `now`.
    pub fn record(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.failure_count += 1;
        if self.first_failed_at.is_none() {
            self.first_failed_at = Some(now);
        }
        self.last_failed_at = Some(now);
        self.last_error = Some(error.into());
    }
}

/// A job as handed to [`Worker::process`](crate::Worker::process).
#[derive(Debug, Clone, PartialEq)]
pub struct JobMessage {
    /// Transport message id of this delivery.
    pub message_id: String,
    /// Topic the job was pulled from.
    pub topic: String,
    /// Decoded envelope.
    pub envelope: JobEnvelope,
    /// Failures recorded by earlier deliveries.
    pub failure: FailureContext,
    /// When this delivery was published.
    pub published_at: DateTime<Utc>,
}

impl JobMessage {
    /// Decode a queue message. A body that is not a [`JobEnvelope`] is a
    /// validation error.
    pub fn from_queue(message: &QueueMessage) -> TollgateResult<Self> {
        let envelope: JobEnvelope = serde_json::from_value(message.payload.clone())
            .map_err(|e| TollgateError::Validation(format!("invalid job envelope: {e}")))?;
        Ok(Self {
            message_id: message.id.clone(),
            topic: message.topic.clone(),
            envelope,
            failure: FailureContext::from_attributes(&message.attributes),
            published_at: message.published_at,
        })
    }
}

/// Body published to the dead-letter topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    /// Dead-letter id; redeliveries of this envelope share it.
    pub id: Uuid,
    /// Topic the job failed on.
    pub original_topic: String,
    /// The job body exactly as it was received.
    pub job: serde_json::Value,
    /// Failure history including the final failure.
    pub failure: FailureContext,
    /// Extra diagnostic detail, e.g. a panic message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
    /// When the job was given up on.
    pub dead_lettered_at: DateTime<Utc>,
}
