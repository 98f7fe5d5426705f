use crate::router::DelegationDecision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tollgate_core::collections::ESCALATIONS;
use tollgate_core::{
    Clock, DocumentStore, DocumentStoreExt, Query, SortDirection, TollgateError, TollgateResult,
};
use tracing::info;
use uuid::Uuid;

/// Review status of an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    /// Waiting for a reviewer.
    Pending,
    /// Approved; may be resumed.
    Approved,
    /// Rejected; will not run.
    Rejected,
    /// Approved and executed.
    Resumed,
}

impl EscalationStatus {
    /// The stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::Pending => "pending",
            EscalationStatus::Approved => "approved",
            EscalationStatus::Rejected => "rejected",
            EscalationStatus::Resumed => "resumed",
        }
    }
}

impl std::fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A run held back for human approval, in the `escalations` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    /// Escalation id.
    pub id: Uuid,
    /// Orchestration run that escalated.
    pub run_id: Uuid,
    /// Requesting session.
    pub session_id: String,
    /// Requesting user.
    pub user_id: String,
    /// The request text.
    pub query: String,
    /// Caller-supplied context of the request.
    #[serde(default)]
    pub context: serde_json::Value,
    /// Delegations that would have run.
    pub delegations: Vec<DelegationDecision>,
    /// Projected usage ratio.
    pub ratio: f64,
    /// Session cap in force.
    pub cap: f64,
    /// Threshold in force.
    pub threshold: f64,
    /// When the run escalated.
    pub created_at: DateTime<Utc>,
    /// Review status.
    pub status: EscalationStatus,
    /// Who reviewed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    /// Reviewer notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// When it was reviewed or resumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Escalation persistence and reviewer triage.
pub struct Escalations {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl Escalations {
    /// Create over a document store.
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Persist a record.
    pub async fn save(&self, record: &EscalationRecord) -> TollgateResult<()> {
        self.store
            .set_as(ESCALATIONS, &record.id.to_string(), record)
            .await
    }

    /// Look up a record.
    pub async fn get(&self, id: Uuid) -> TollgateResult<Option<EscalationRecord>> {
        self.store.get_as(ESCALATIONS, &id.to_string()).await
    }

    /// Escalations awaiting review, oldest first.
    pub async fn list_pending(&self) -> TollgateResult<Vec<EscalationRecord>> {
        let query = Query::new()
            .where_eq("status", EscalationStatus::Pending.as_str())
            .order_by("created_at", SortDirection::Asc);
        self.store.query_as(ESCALATIONS, &query).await
    }

    async fn transition(
        &self,
        id: Uuid,
        from: EscalationStatus,
        to: EscalationStatus,
        reviewer: Option<String>,
        notes: Option<String>,
    ) -> TollgateResult<EscalationRecord> {
        let mut record = self.get(id).await?.ok_or_else(|| TollgateError::NotFound {
            collection: ESCALATIONS.to_string(),
            id: id.to_string(),
        })?;
        if record.status != from {
            return Err(TollgateError::InvalidTransition {
                id: id.to_string(),
                from: record.status.to_string(),
                to: to.to_string(),
            });
        }
        record.status = to;
        if reviewer.is_some() {
            record.reviewer = reviewer;
        }
        if notes.is_some() {
            record.notes = notes;
        }
        record.resolved_at = Some(self.clock.now());
        self.save(&record).await?;
        info!(
            escalation_id = %id,
            status = %to,
            reviewer = record.reviewer.as_deref().unwrap_or("-"),
            "Escalation updated"
        );
        Ok(record)
    }

    /// Approve a pending escalation.
    pub async fn approve(
        &self,
        id: Uuid,
        reviewer: impl Into<String>,
        notes: Option<String>,
    ) -> TollgateResult<EscalationRecord> {
        self.transition(
            id,
            EscalationStatus::Pending,
            EscalationStatus::Approved,
            Some(reviewer.into()),
            notes,
        )
        .await
    }

    /// Reject a pending escalation.
    pub async fn reject(
        &self,
        id: Uuid,
        reviewer: impl Into<String>,
        notes: Option<String>,
    ) -> TollgateResult<EscalationRecord> {
        self.transition(
            id,
            EscalationStatus::Pending,
            EscalationStatus::Rejected,
            Some(reviewer.into()),
            notes,
        )
        .await
    }

    /// Mark an approved escalation as executed.
    pub async fn mark_resumed(&self, id: Uuid) -> TollgateResult<EscalationRecord> {
        self.transition(
            id,
            EscalationStatus::Approved,
            EscalationStatus::Resumed,
            None,
            None,
        )
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tollgate_backends::MemoryDocumentStore;
    use tollgate_core::ManualClock;

    fn record() -> EscalationRecord {
        EscalationRecord {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            session_id: "s1".into(),
            user_id: "u1".into(),
            query: "research everything".into(),
            context: serde_json::Value::Null,
            delegations: Vec::new(),
            ratio: 0.85,
            cap: 100.0,
            threshold: 0.8,
            created_at: Utc::now(),
            status: EscalationStatus::Pending,
            reviewer: None,
            notes: None,
            resolved_at: None,
        }
    }

    fn escalations() -> Escalations {
        Escalations::new(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(ManualClock::default()),
        )
    }

    #[tokio::test]
    async fn test_approve_then_resume() {
        let e = escalations();
        let r = record();
        e.save(&r).await.unwrap();
        assert_eq!(e.list_pending().await.unwrap().len(), 1);

        let approved = e.approve(r.id, "ops", Some("ok".into())).await.unwrap();
        assert_eq!(approved.status, EscalationStatus::Approved);
        assert_eq!(approved.reviewer.as_deref(), Some("ops"));
        assert!(e.list_pending().await.unwrap().is_empty());

        let resumed = e.mark_resumed(r.id).await.unwrap();
        assert_eq!(resumed.status, EscalationStatus::Resumed);
        assert_eq!(resumed.notes.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_rejected_cannot_resume() {
        let e = escalations();
        let r = record();
        e.save(&r).await.unwrap();
        e.reject(r.id, "ops", None).await.unwrap();
        let err = e.mark_resumed(r.id).await.unwrap_err();
        assert!(matches!(err, TollgateError::InvalidTransition { .. }));
        assert!(e.approve(r.id, "ops", None).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_escalation() {
        let err = escalations()
            .approve(Uuid::new_v4(), "ops", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::NotFound { .. }));
    }
}
