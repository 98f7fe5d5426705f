use crate::clock::Clock;
use crate::collections::AUDIT_LOGS;
use crate::error::TollgateResult;
use crate::store::{DocumentStore, DocumentStoreExt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// One line of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Entry id.
    pub id: Uuid,
    /// When the action happened.
    pub timestamp: DateTime<Utc>,
    /// Session the action belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// What happened, e.g. `dead_letter.received`.
    pub action: String,
    /// Component that performed the action.
    pub actor: String,
    /// Free-form structured details.
    pub details: serde_json::Value,
    /// Outcome classification.
    pub outcome: AuditOutcome,
}

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// The action succeeded.
    Success,
    /// The action was refused (e.g. budget escalation).
    Denied,
    /// The action failed.
    Error,
}

/// Append-only audit log that records pipeline actions in the document store.
pub struct AuditLog {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    /// Create an audit log writing to `store`.
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Persist an entry.
    pub async fn log(&self, entry: AuditEntry) -> TollgateResult<()> {
        info!(
            session_id = entry.session_id.as_deref().unwrap_or("-"),
            action = %entry.action,
            actor = %entry.actor,
            outcome = ?entry.outcome,
            "audit"
        );
        self.store
            .set_as(AUDIT_LOGS, &entry.id.to_string(), &entry)
            .await
    }

    /// Build and persist an entry stamped with the current time.
    pub async fn log_action(
        &self,
        session_id: Option<String>,
        action: impl Into<String>,
        actor: impl Into<String>,
        details: serde_json::Value,
        outcome: AuditOutcome,
    ) -> TollgateResult<AuditEntry> {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            timestamp: self.clock.now(),
            session_id,
            action: action.into(),
            actor: actor.into(),
            details,
            outcome,
        };
        self.log(entry.clone()).await?;
        Ok(entry)
    }
}
