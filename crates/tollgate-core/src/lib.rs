//! Core types and port definitions for the Tollgate delegation pipeline.
//!
//! This crate provides the foundational types shared across all Tollgate crates:
//! error handling, the injected clock, and the three backing-service ports the
//! rest of the system is written against.
//!
//! # Main types
//!
//! - [`TollgateError`] — Unified error enum for all Tollgate subsystems.
//! - [`TollgateResult`] — Convenience alias for `Result<T, TollgateError>`.
//! - [`DocumentStore`] — Durable document store, the sole source of truth.
//! - [`DocumentStoreExt`] — Typed (serde) boundary over any [`DocumentStore`].
//! - [`MessageQueue`] — At-least-once topic queue.
//! - [`Sandbox`] — Isolated code execution environment.
//! - [`Clock`] — Injected wall clock ([`SystemClock`], [`ManualClock`]).
//! - [`AuditLog`] — Append-only audit trail persisted to the document store.

/// Audit logging over the document store.
pub mod audit;
/// Injected wall clocks.
pub mod clock;
/// Error types.
pub mod error;
/// Message queue port.
pub mod queue;
/// Sandboxed execution port.
pub mod sandbox;
/// Document store port and query model.
pub mod store;

pub use audit::{AuditEntry, AuditLog, AuditOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{TollgateError, TollgateResult};
pub use queue::{MessageQueue, QueueMessage};
pub use sandbox::{Sandbox, SandboxOutcome, SandboxRequest};
pub use store::{DocumentStore, DocumentStoreExt, Filter, FilterOp, OrderBy, Query, SortDirection};

/// Well-known collection names shared by every crate in the workspace.
pub mod collections {
    /// Task documents.
    pub const TASKS: &str = "tasks";
    /// Per-agent budget ledger entries.
    pub const BUDGET_LEDGER: &str = "budget_ledger";
    /// Budget escalations awaiting human review.
    pub const ESCALATIONS: &str = "escalations";
    /// One document per orchestration run.
    pub const ORCHESTRATION_AUDIT: &str = "orchestration_audit";
    /// Generic audit trail.
    pub const AUDIT_LOGS: &str = "audit_logs";
    /// Dead-lettered jobs.
    pub const DEAD_LETTERS: &str = "dead_letters";
    /// Threshold alerts raised by the dead-letter handler.
    pub const ALERTS: &str = "alerts";
}
