use crate::job::{DeadLetterEnvelope, JobMessage};
use crate::window::SlidingWindowCounter;
use crate::worker::{ProcessOutcome, Worker};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tollgate_core::collections::{ALERTS, DEAD_LETTERS};
use tollgate_core::{
    AuditLog, AuditOutcome, Clock, DocumentStore, DocumentStoreExt, MessageQueue, Query,
    SortDirection, TollgateError, TollgateResult,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Triage status of a dead-lettered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    /// Waiting for an operator.
    Pending,
    /// Looked at, notes recorded.
    Analyzed,
    /// Sent back to its original topic.
    Reprocessed,
    /// Dropped.
    Discarded,
}

impl DeadLetterStatus {
    /// The stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::Pending => "pending",
            DeadLetterStatus::Analyzed => "analyzed",
            DeadLetterStatus::Reprocessed => "reprocessed",
            DeadLetterStatus::Discarded => "discarded",
        }
    }
}

/// A dead-lettered job, persisted in the `dead_letters` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Record id (the dead-letter envelope id).
    pub id: Uuid,
    /// Topic the job failed on.
    pub original_topic: String,
    /// The job body exactly as it was received.
    pub original_payload: serde_json::Value,
    /// Final error.
    pub error_message: String,
    /// Extra diagnostic detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
    /// Failures in total.
    pub failure_count: u32,
    /// First failure.
    pub first_failed_at: DateTime<Utc>,
    /// Last failure.
    pub last_failed_at: DateTime<Utc>,
    /// Triage status.
    pub status: DeadLetterStatus,
    /// Operator notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
    /// Last triage change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Set once the receipt has been audited and counted toward alerting.
    #[serde(default)]
    pub audited: bool,
}

/// Raised when a topic's dead-letter rate crosses the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Alert id.
    pub id: Uuid,
    /// Topic whose jobs are failing.
    pub topic: String,
    /// Dead letters within the window when the alert fired.
    pub count: u32,
    /// Configured threshold.
    pub threshold: u32,
    /// Window width.
    pub window_minutes: u32,
    /// When the alert fired.
    pub raised_at: DateTime<Utc>,
    /// Human-readable summary.
    pub message: String,
}

/// Alerting knobs for the [`DeadLetterHandler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// An alert fires when the windowed count first exceeds this.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: u32,
    /// Width of the counting window.
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u32,
}

fn default_alert_threshold() -> u32 {
    5
}

fn default_window_minutes() -> u32 {
    60
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            alert_threshold: default_alert_threshold(),
            window_minutes: default_window_minutes(),
        }
    }
}

/// Consumes the dead-letter topic: records, audits, counts, and alerts.
/// Also exposes the operator triage operations.
pub struct DeadLetterHandler {
    store: Arc<dyn DocumentStore>,
    queue: Arc<dyn MessageQueue>,
    audit: AuditLog,
    window: SlidingWindowCounter,
    config: DeadLetterConfig,
    clock: Arc<dyn Clock>,
}

impl DeadLetterHandler {
    /// Create a handler.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        queue: Arc<dyn MessageQueue>,
        clock: Arc<dyn Clock>,
        config: DeadLetterConfig,
    ) -> Self {
        Self {
            audit: AuditLog::new(Arc::clone(&store), Arc::clone(&clock)),
            window: SlidingWindowCounter::new(config.window_minutes, Arc::clone(&clock)),
            store,
            queue,
            config,
            clock,
        }
    }

    /// Dead letters counted for `topic` in the current window.
    pub fn windowed_count(&self, topic: &str) -> u32 {
        self.window.count(topic)
    }

    /// Record one dead-lettered job.
    ///
    /// Redeliveries of an envelope already on file return the stored record.
    /// A record whose audit or alert step failed on an earlier delivery has
    /// those steps finished instead.
    pub async fn record(
        &self,
        envelope: DeadLetterEnvelope,
    ) -> TollgateResult<(DeadLetterRecord, Option<Alert>)> {
        let id = envelope.id.to_string();
        let mut record = match self
            .store
            .get_as::<DeadLetterRecord>(DEAD_LETTERS, &id)
            .await?
        {
            Some(existing) if existing.audited => {
                info!(dead_letter_id = %id, "Duplicate dead letter ignored");
                return Ok((existing, None));
            }
            Some(existing) => {
                info!(dead_letter_id = %id, "Finishing partially recorded dead letter");
                existing
            }
            None => {
                let record = Self::new_record(envelope, self.clock.now());
                self.store.set_as(DEAD_LETTERS, &id, &record).await?;
                warn!(
                    dead_letter_id = %id,
                    topic = %record.original_topic,
                    failure_count = record.failure_count,
                    error = %record.error_message,
                    "Dead letter recorded"
                );
                record
            }
        };

        self.audit
            .log_action(
                None,
                "dead_letter.received",
                "dead-letter-handler",
                serde_json::json!({
                    "dead_letter_id": id,
                    "topic": record.original_topic,
                    "failure_count": record.failure_count,
                    "error": record.error_message,
                }),
                AuditOutcome::Error,
            )
            .await?;

        let (before, after) = self.window.increment(&record.original_topic);
        let threshold = self.config.alert_threshold;
        let alert = if before <= threshold && after > threshold {
            Some(self.raise_alert(&record.original_topic, after).await?)
        } else {
            None
        };

        record.audited = true;
        self.store
            .update(DEAD_LETTERS, &id, serde_json::json!({ "audited": true }))
            .await?;
        Ok((record, alert))
    }

    fn new_record(envelope: DeadLetterEnvelope, now: DateTime<Utc>) -> DeadLetterRecord {
        let failure = envelope.failure;
        DeadLetterRecord {
            id: envelope.id,
            original_topic: envelope.original_topic,
            original_payload: envelope.job,
            error_message: failure
                .last_error
                .unwrap_or_else(|| "unknown error".to_string()),
            error_stack: envelope.error_stack,
            failure_count: failure.failure_count,
            first_failed_at: failure.first_failed_at.unwrap_or(envelope.dead_lettered_at),
            last_failed_at: failure.last_failed_at.unwrap_or(envelope.dead_lettered_at),
            status: DeadLetterStatus::Pending,
            notes: None,
            created_at: now,
            updated_at: None,
            audited: false,
        }
    }

    async fn raise_alert(&self, topic: &str, count: u32) -> TollgateResult<Alert> {
        let alert = Alert {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            count,
            threshold: self.config.alert_threshold,
            window_minutes: self.window.window_minutes(),
            raised_at: self.clock.now(),
            message: format!(
                "{count} jobs on '{topic}' dead-lettered within {} minutes (threshold {})",
                self.window.window_minutes(),
                self.config.alert_threshold
            ),
        };
        self.store
            .set_as(ALERTS, &alert.id.to_string(), &alert)
            .await?;
        warn!(topic, count, threshold = alert.threshold, "Dead-letter alert raised");
        Ok(alert)
    }

    /// Alerts on file, newest first.
    pub async fn alerts(&self) -> TollgateResult<Vec<Alert>> {
        let query = Query::new().order_by("raised_at", SortDirection::Desc);
        self.store.query_as(ALERTS, &query).await
    }

    /// Look up one record.
    pub async fn get(&self, id: Uuid) -> TollgateResult<Option<DeadLetterRecord>> {
        self.store.get_as(DEAD_LETTERS, &id.to_string()).await
    }

    /// Records awaiting triage, oldest first.
    pub async fn list_pending(&self, limit: Option<usize>) -> TollgateResult<Vec<DeadLetterRecord>> {
        let mut query = Query::new()
            .where_eq("status", DeadLetterStatus::Pending.as_str())
            .order_by("created_at", SortDirection::Asc);
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        self.store.query_as(DEAD_LETTERS, &query).await
    }

    /// Set any status, optionally replacing the notes.
    pub async fn set_status(
        &self,
        id: Uuid,
        status: DeadLetterStatus,
        notes: Option<String>,
    ) -> TollgateResult<DeadLetterRecord> {
        let key = id.to_string();
        let mut record = self
            .get(id)
            .await?
            .ok_or_else(|| TollgateError::NotFound {
                collection: DEAD_LETTERS.to_string(),
                id: key.clone(),
            })?;
        record.status = status;
        if notes.is_some() {
            record.notes = notes;
        }
        record.updated_at = Some(self.clock.now());
        self.store.set_as(DEAD_LETTERS, &key, &record).await?;
        info!(dead_letter_id = %key, status = status.as_str(), "Dead letter triaged");
        Ok(record)
    }

    /// Mark analyzed with notes.
    pub async fn analyze(&self, id: Uuid, notes: impl Into<String>) -> TollgateResult<DeadLetterRecord> {
        self.set_status(id, DeadLetterStatus::Analyzed, Some(notes.into()))
            .await
    }

    /// Republish the original job to its original topic with a clean failure
    /// history, then mark reprocessed.
    pub async fn reprocess(&self, id: Uuid) -> TollgateResult<DeadLetterRecord> {
        let record = self
            .get(id)
            .await?
            .ok_or_else(|| TollgateError::NotFound {
                collection: DEAD_LETTERS.to_string(),
                id: id.to_string(),
            })?;
        self.queue
            .publish(
                &record.original_topic,
                record.original_payload.clone(),
                HashMap::new(),
            )
            .await?;
        self.audit
            .log_action(
                None,
                "dead_letter.reprocessed",
                "dead-letter-handler",
                serde_json::json!({
                    "dead_letter_id": id,
                    "topic": record.original_topic,
                }),
                AuditOutcome::Success,
            )
            .await?;
        self.set_status(id, DeadLetterStatus::Reprocessed, None).await
    }

    /// Mark discarded.
    pub async fn discard(&self, id: Uuid) -> TollgateResult<DeadLetterRecord> {
        self.set_status(id, DeadLetterStatus::Discarded, None).await
    }
}

#[async_trait]
impl Worker for DeadLetterHandler {
    type Payload = DeadLetterEnvelope;

    fn name(&self) -> &str {
        "dead-letter-handler"
    }

    async fn process(
        &self,
        payload: DeadLetterEnvelope,
        _job: &JobMessage,
    ) -> TollgateResult<ProcessOutcome> {
        let started = Instant::now();
        let (record, alert) = self.record(payload).await?;
        Ok(ProcessOutcome::success(serde_json::json!({
            "dead_letter_id": record.id,
            "alert_id": alert.map(|a| a.id),
        }))
        .with_duration_ms(started.elapsed().as_millis() as u64))
    }
}
