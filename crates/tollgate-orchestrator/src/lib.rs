//! Budget-gated multi-agent delegation for Tollgate.
//!
//! Requests are routed to agents by capability keywords, checked against the
//! per-agent budget ledger, and either executed in per-agent sandboxes or held
//! for human approval. Tasks form a bounded delegation tree whose children are
//! dispatched over the task topic.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Runs the Retrieve → Route → Budget-Check → Execute pipeline.
//! - [`TaskStore`] — Task lifecycle, delegation fan-out, and dispatch.
//! - [`CapabilityRouter`] — Keyword matching of requests to agent profiles.
//! - [`BudgetLedger`] — Per-agent spend with serialized atomic updates.
//! - [`Escalations`] — Runs awaiting human approval.
//! - [`TaskDispatchWorker`] — Worker that executes dispatched tasks.
//! - [`AgentMonitor`] — Process-local per-agent counters.

/// Orchestrator configuration.
pub mod config;
/// Task topic consumer.
pub mod dispatch;
/// Orchestration engine.
pub mod engine;
/// Escalation records and review.
pub mod escalation;
/// Budget ledger.
pub mod ledger;
/// Agent health and metrics monitoring.
pub mod monitor;
/// Default agent profiles.
pub mod profiles;
/// Capability router.
pub mod router;
/// Sandbox program templates.
pub mod snippet;
/// Delegation tree limits and child construction.
pub mod spawner;
/// Task persistence and lifecycle.
pub mod task_store;
/// Shared task and agent types.
pub mod types;

pub use config::OrchestratorConfig;
pub use dispatch::TaskDispatchWorker;
pub use engine::{
    Backends, DelegationExecution, OrchestrationAudit, OrchestrationOutcome, OrchestrationRequest,
    Orchestrator, RunStage,
};
pub use escalation::{EscalationRecord, EscalationStatus, Escalations};
pub use ledger::{BudgetLedger, LedgerEntry};
pub use monitor::{AgentMetrics, AgentMonitor, AgentState, AgentStatus};
pub use profiles::default_profiles;
pub use router::{CapabilityRouter, DelegationDecision};
pub use spawner::{DelegationLimits, DelegationSpawner, RejectedDelegation};
pub use task_store::{Completion, NewTask, TaskStore};
pub use types::{
    AgentId, AgentProfile, Attachment, DelegationRequest, Task, TaskDispatch, TaskPayload,
    TaskResult, TaskStatus,
};
