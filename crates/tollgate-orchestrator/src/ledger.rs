use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tollgate_core::collections::BUDGET_LEDGER;
use tollgate_core::{
    Clock, DocumentStore, DocumentStoreExt, Query, SortDirection, TollgateError, TollgateResult,
};
use tracing::info;

/// One agent's budget account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Account owner.
    pub agent_id: String,
    /// Initial allocation.
    pub initial: f64,
    /// Total debited.
    pub spent: f64,
    /// Held for work that has not been debited yet.
    #[serde(default)]
    pub reserved: f64,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// `initial - spent - reserved`. May go negative; debits are never refused.
    pub fn available(&self) -> f64 {
        self.initial - self.spent - self.reserved
    }
}

/// Per-agent budget accounts in the `budget_ledger` collection.
///
/// Every mutation of one agent's account holds that agent's lock for the
/// whole read-modify-write, so concurrent debits never lose updates.
pub struct BudgetLedger {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    default_initial: f64,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl BudgetLedger {
    /// Create a ledger. Accounts that do not exist yet open with
    /// `default_initial`.
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, default_initial: f64) -> Self {
        Self {
            store,
            clock,
            default_initial,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.lock().entry(agent_id.to_string()).or_default());
        lock.lock_owned().await
    }

    async fn load_or_open(&self, agent_id: &str, initial: f64) -> TollgateResult<LedgerEntry> {
        if let Some(entry) = self.store.get_as(BUDGET_LEDGER, agent_id).await? {
            return Ok(entry);
        }
        let entry = LedgerEntry {
            agent_id: agent_id.to_string(),
            initial,
            spent: 0.0,
            reserved: 0.0,
            updated_at: self.clock.now(),
        };
        self.store.set_as(BUDGET_LEDGER, agent_id, &entry).await?;
        info!(agent_id, initial, "Ledger account opened");
        Ok(entry)
    }

    /// Open an account with `initial`. An existing account is returned
    /// unchanged.
    pub async fn open_account(&self, agent_id: &str, initial: f64) -> TollgateResult<LedgerEntry> {
        validate_amount(initial)?;
        let _guard = self.lock(agent_id).await;
        self.load_or_open(agent_id, initial).await
    }

    /// The agent's account, opened with the default allocation if missing.
    pub async fn entry(&self, agent_id: &str) -> TollgateResult<LedgerEntry> {
        let _guard = self.lock(agent_id).await;
        self.load_or_open(agent_id, self.default_initial).await
    }

    /// The agent's available balance.
    pub async fn available(&self, agent_id: &str) -> TollgateResult<f64> {
        Ok(self.entry(agent_id).await?.available())
    }

    /// All accounts, by agent id.
    pub async fn entries(&self) -> TollgateResult<Vec<LedgerEntry>> {
        let query = Query::new().order_by("agent_id", SortDirection::Asc);
        self.store.query_as(BUDGET_LEDGER, &query).await
    }

    async fn apply(
        &self,
        agent_id: &str,
        amount: f64,
        op: &'static str,
        change: impl FnOnce(&mut LedgerEntry, f64),
    ) -> TollgateResult<LedgerEntry> {
        validate_amount(amount)?;
        let _guard = self.lock(agent_id).await;
        let mut entry = self.load_or_open(agent_id, self.default_initial).await?;
        change(&mut entry, amount);
        entry.updated_at = self.clock.now();
        self.store.set_as(BUDGET_LEDGER, agent_id, &entry).await?;
        info!(
            agent_id,
            op,
            amount,
            spent = entry.spent,
            reserved = entry.reserved,
            available = entry.available(),
            "Ledger updated"
        );
        Ok(entry)
    }

    /// Add `amount` to the agent's spend.
    pub async fn debit(&self, agent_id: &str, amount: f64) -> TollgateResult<LedgerEntry> {
        self.apply(agent_id, amount, "debit", |e, a| e.spent += a)
            .await
    }

    /// Hold `amount` of the agent's balance.
    pub async fn reserve(&self, agent_id: &str, amount: f64) -> TollgateResult<LedgerEntry> {
        self.apply(agent_id, amount, "reserve", |e, a| e.reserved += a)
            .await
    }

    /// Release up to `amount` of a previous reservation.
    pub async fn release(&self, agent_id: &str, amount: f64) -> TollgateResult<LedgerEntry> {
        self.apply(agent_id, amount, "release", |e, a| {
            e.reserved = (e.reserved - a).max(0.0);
        })
        .await
    }
}

fn validate_amount(amount: f64) -> TollgateResult<()> {
    if amount.is_finite() && amount >= 0.0 {
        Ok(())
    } else {
        Err(TollgateError::Validation(format!(
            "ledger amount must be a non-negative number, got {amount}"
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tollgate_backends::MemoryDocumentStore;
    use tollgate_core::ManualClock;

    fn ledger() -> BudgetLedger {
        BudgetLedger::new(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(ManualClock::default()),
            100.0,
        )
    }

    #[tokio::test]
    async fn test_lazy_open_with_default() {
        let l = ledger();
        assert_eq!(l.available("research").await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn test_open_account_is_idempotent() {
        let l = ledger();
        l.open_account("code", 50.0).await.unwrap();
        l.debit("code", 5.0).await.unwrap();
        let again = l.open_account("code", 999.0).await.unwrap();
        assert_eq!(again.initial, 50.0);
        assert_eq!(again.spent, 5.0);
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let l = ledger();
        l.reserve("data", 30.0).await.unwrap();
        assert_eq!(l.available("data").await.unwrap(), 70.0);
        let e = l.release("data", 50.0).await.unwrap();
        assert_eq!(e.reserved, 0.0);
        assert_eq!(e.available(), 100.0);
    }

    #[tokio::test]
    async fn test_debit_may_overdraw() {
        let l = ledger();
        let e = l.debit("code", 150.0).await.unwrap();
        assert_eq!(e.available(), -50.0);
    }

    #[tokio::test]
    async fn test_rejects_bad_amounts() {
        let l = ledger();
        assert!(l.debit("code", -1.0).await.is_err());
        assert!(l.debit("code", f64::NAN).await.is_err());
    }

    #[tokio::test]
    async fn test_entries_sorted() {
        let l = ledger();
        l.debit("zeta", 1.0).await.unwrap();
        l.debit("alpha", 1.0).await.unwrap();
        let ids: Vec<_> = l.entries().await.unwrap().into_iter().map(|e| e.agent_id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }
}
