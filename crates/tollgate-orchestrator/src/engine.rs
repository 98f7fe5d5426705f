use crate::config::OrchestratorConfig;
use crate::escalation::{EscalationRecord, EscalationStatus, Escalations};
use crate::ledger::BudgetLedger;
use crate::monitor::AgentMonitor;
use crate::router::{CapabilityRouter, DelegationDecision};
use crate::snippet;
use crate::task_store::TaskStore;
use crate::types::{AgentProfile, Task, TaskStatus};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tollgate_core::collections::ORCHESTRATION_AUDIT;
use tollgate_core::{
    AuditLog, AuditOutcome, Clock, DocumentStore, DocumentStoreExt, MessageQueue, Sandbox,
    SandboxRequest, TollgateError, TollgateResult,
};
use tracing::{error, info, warn};
use uuid::Uuid;

/// The backing services an [`Orchestrator`] is built on.
#[derive(Clone)]
pub struct Backends {
    /// Durable document store.
    pub store: Arc<dyn DocumentStore>,
    /// Task and job queue.
    pub queue: Arc<dyn MessageQueue>,
    /// Isolated execution environment.
    pub sandbox: Arc<dyn Sandbox>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
}

/// An incoming request to orchestrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    /// Requesting session.
    pub session_id: String,
    /// Requesting user.
    pub user_id: String,
    /// Request text.
    pub query: String,
    /// Caller-supplied context.
    #[serde(default)]
    pub context: serde_json::Value,
}

/// What happened to one delegation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationExecution {
    /// Agent that ran.
    pub agent_id: String,
    /// Sandbox it ran in.
    pub sandbox_id: String,
    /// Whether it succeeded.
    pub success: bool,
    /// Sandbox output.
    pub output: String,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Cost charged.
    pub cost: f64,
    /// Wall time of the attempt.
    pub latency_ms: u64,
    /// Whether the attempt hit the sandbox timeout.
    #[serde(default)]
    pub timed_out: bool,
    /// Whether the failure came from the sandbox service rather than the
    /// agent's code, so another attempt may succeed.
    #[serde(default)]
    pub transient: bool,
    /// Whether the ledger debit went through.
    pub debited: bool,
}

/// Result of an orchestration run. Escalation is an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationOutcome {
    /// Run id; also the id of the run's audit document.
    pub run_id: Uuid,
    /// Requesting session.
    pub session_id: String,
    /// True when every delegation succeeded.
    pub success: bool,
    /// True when the run was held for human approval.
    pub escalated: bool,
    /// Escalation created or resumed by this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_id: Option<Uuid>,
    /// Human-readable summary.
    pub message: String,
    /// Concatenated output of the successful delegations.
    pub output: String,
    /// Usage ratio computed by the budget check.
    pub ratio: f64,
    /// Delegations chosen for the request.
    pub delegations: Vec<DelegationDecision>,
    /// Per-delegation results; empty when escalated.
    pub executions: Vec<DelegationExecution>,
}

impl OrchestrationOutcome {
    /// True when the run failed and every failed delegation failed for a
    /// transient reason (sandbox outage or timeout).
    pub fn failed_transiently(&self) -> bool {
        !self.success
            && !self.escalated
            && self.executions.iter().any(|e| !e.success)
            && self
                .executions
                .iter()
                .filter(|e| !e.success)
                .all(|e| e.transient)
    }
}

/// How a run ended, as recorded in its audit document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    /// Held for approval.
    Escalated,
    /// Executed after passing the budget check.
    Executed,
    /// Executed from an approved escalation.
    Resumed,
}

/// One document per run in the `orchestration_audit` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationAudit {
    /// Run id.
    pub id: Uuid,
    /// Requesting session.
    pub session_id: String,
    /// Requesting user.
    pub user_id: String,
    /// Request text.
    pub query: String,
    /// How the run ended.
    pub stage: RunStage,
    /// Overall success.
    pub success: bool,
    /// Related escalation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_id: Option<Uuid>,
    /// Usage ratio.
    pub ratio: f64,
    /// Session cap in force.
    pub cap: f64,
    /// Threshold in force.
    pub threshold: f64,
    /// Delegations chosen.
    pub delegations: Vec<DelegationDecision>,
    /// Per-delegation cost, success, and latency.
    pub executions: Vec<DelegationExecution>,
    /// Sum of charged costs.
    pub total_cost: f64,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
}

/// The budget-gated delegation engine.
///
/// Each run goes Retrieve-Context → Analyze-Delegations → Budget-Check →
/// {Escalate | Execute} → Aggregate → Persist-Audit.
pub struct Orchestrator {
    config: OrchestratorConfig,
    router: Arc<CapabilityRouter>,
    ledger: Arc<BudgetLedger>,
    tasks: Arc<TaskStore>,
    escalations: Arc<Escalations>,
    monitor: Arc<AgentMonitor>,
    audit: AuditLog,
    backends: Backends,
}

impl Orchestrator {
    /// Validate `config` and wire every service over `backends`.
    pub fn new(
        config: OrchestratorConfig,
        profiles: Vec<AgentProfile>,
        backends: Backends,
    ) -> TollgateResult<Self> {
        config.validate()?;
        let router = Arc::new(CapabilityRouter::new(
            profiles,
            config.default_agent.clone(),
            config.base_cost,
        )?);
        let ledger = Arc::new(BudgetLedger::new(
            Arc::clone(&backends.store),
            Arc::clone(&backends.clock),
            config.default_initial_budget,
        ));
        let tasks = Arc::new(TaskStore::new(
            Arc::clone(&backends.store),
            Arc::clone(&backends.queue),
            Arc::clone(&router),
            Arc::clone(&backends.clock),
            &config,
        ));
        let escalations = Arc::new(Escalations::new(
            Arc::clone(&backends.store),
            Arc::clone(&backends.clock),
        ));
        let audit = AuditLog::new(Arc::clone(&backends.store), Arc::clone(&backends.clock));
        Ok(Self {
            config,
            router,
            ledger,
            tasks,
            escalations,
            monitor: Arc::new(AgentMonitor::new()),
            audit,
            backends,
        })
    }

    /// The configuration in force.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The capability router.
    pub fn router(&self) -> &Arc<CapabilityRouter> {
        &self.router
    }

    /// The budget ledger.
    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    /// The task store.
    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    /// Escalation triage.
    pub fn escalations(&self) -> &Arc<Escalations> {
        &self.escalations
    }

    /// Per-agent counters.
    pub fn monitor(&self) -> &Arc<AgentMonitor> {
        &self.monitor
    }

    /// Orchestrate a request.
    pub async fn run(&self, request: OrchestrationRequest) -> TollgateResult<OrchestrationOutcome> {
        if request.query.trim().is_empty() {
            return Err(TollgateError::Validation(
                "orchestration query must not be empty".to_string(),
            ));
        }
        let mut decisions = self.router.route(&request.query);
        if decisions.is_empty() {
            decisions.push(self.router.default_decision());
        }
        self.run_decisions(request, decisions).await
    }

    /// Run one task through the same budget gate, delegating to the task's
    /// assigned agent.
    pub async fn run_task(&self, task: &Task) -> TollgateResult<OrchestrationOutcome> {
        let profile = self.router.profile(&task.agent_role);
        let decision = DelegationDecision {
            agent_id: task.agent_role.clone(),
            reason: format!("assigned by task {}", task.id),
            confidence: 1.0,
            capabilities: profile.map(|p| p.capabilities.clone()).unwrap_or_default(),
            estimated_cost: profile.map_or(self.config.base_cost, |p| p.base_cost),
        };
        let user_id = task
            .metadata
            .get("user_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(task.conversation_id.as_str())
            .to_string();
        let request = OrchestrationRequest {
            session_id: task.session_id.clone(),
            user_id,
            query: task.payload.content.clone(),
            context: task.payload.context.clone(),
        };
        self.run_decisions(request, vec![decision]).await
    }

    async fn run_decisions(
        &self,
        request: OrchestrationRequest,
        decisions: Vec<DelegationDecision>,
    ) -> TollgateResult<OrchestrationOutcome> {
        let run_id = Uuid::new_v4();
        let started_at = self.backends.clock.now();
        info!(
            run_id = %run_id,
            session_id = %request.session_id,
            delegations = decisions.len(),
            "Orchestration started"
        );

        let context = self.retrieve_context(&request).await?;

        let ratio = self.usage_ratio(&decisions).await?;
        if ratio > self.config.escalation_threshold {
            return self
                .escalate(run_id, started_at, request, decisions, ratio)
                .await;
        }

        let executions = self
            .execute_all(run_id, &request, &context, &decisions)
            .await;
        let outcome = self.aggregate(run_id, &request, decisions, executions, ratio, None);
        self.persist_audit(&request, &outcome, RunStage::Executed, started_at)
            .await;
        Ok(outcome)
    }

    /// Execute an approved escalation's stored delegations without a budget
    /// check. The escalation is marked resumed before anything runs, so it
    /// executes at most once.
    pub async fn resume_escalation(&self, id: Uuid) -> TollgateResult<OrchestrationOutcome> {
        let record = self
            .escalations
            .get(id)
            .await?
            .ok_or_else(|| TollgateError::NotFound {
                collection: tollgate_core::collections::ESCALATIONS.to_string(),
                id: id.to_string(),
            })?;
        if record.status != EscalationStatus::Approved {
            return Err(TollgateError::InvalidTransition {
                id: id.to_string(),
                from: record.status.to_string(),
                to: EscalationStatus::Resumed.to_string(),
            });
        }
        self.escalations.mark_resumed(id).await?;

        let run_id = Uuid::new_v4();
        let started_at = self.backends.clock.now();
        info!(run_id = %run_id, escalation_id = %id, "Resuming escalation");
        let request = OrchestrationRequest {
            session_id: record.session_id,
            user_id: record.user_id,
            query: record.query,
            context: record.context,
        };
        let context = self.retrieve_context(&request).await?;
        let executions = self
            .execute_all(run_id, &request, &context, &record.delegations)
            .await;
        let outcome = self.aggregate(
            run_id,
            &request,
            record.delegations,
            executions,
            record.ratio,
            Some(id),
        );
        self.persist_audit(&request, &outcome, RunStage::Resumed, started_at)
            .await;
        Ok(outcome)
    }

    /// The session's most recent completed outputs plus the caller's context.
    async fn retrieve_context(
        &self,
        request: &OrchestrationRequest,
    ) -> TollgateResult<serde_json::Value> {
        let completed = self
            .tasks
            .get_session_tasks(&request.session_id, Some(TaskStatus::Completed))
            .await?;
        let skip = completed.len().saturating_sub(self.config.context_window);
        let recent: Vec<serde_json::Value> = completed
            .into_iter()
            .skip(skip)
            .filter_map(|task| {
                let output = task.result?.output;
                Some(serde_json::json!({
                    "task_id": task.id,
                    "agent_role": task.agent_role,
                    "output": output,
                }))
            })
            .collect();
        Ok(serde_json::json!({
            "caller": request.context,
            "recent": recent,
        }))
    }

    /// `(C - available + Σ cost) / C`, with `available` the smallest balance
    /// among the targeted agents.
    async fn usage_ratio(&self, decisions: &[DelegationDecision]) -> TollgateResult<f64> {
        let cap = self.config.session_cap;
        let mut available: Option<f64> = None;
        for decision in decisions {
            let balance = self.ledger.available(&decision.agent_id).await?;
            available = Some(available.map_or(balance, |a: f64| a.min(balance)));
        }
        let available = available.unwrap_or(cap);
        let projected: f64 = decisions.iter().map(|d| d.estimated_cost).sum();
        Ok((cap - available + projected) / cap)
    }

    async fn escalate(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        request: OrchestrationRequest,
        decisions: Vec<DelegationDecision>,
        ratio: f64,
    ) -> TollgateResult<OrchestrationOutcome> {
        let record = EscalationRecord {
            id: Uuid::new_v4(),
            run_id,
            session_id: request.session_id.clone(),
            user_id: request.user_id.clone(),
            query: request.query.clone(),
            context: request.context.clone(),
            delegations: decisions.clone(),
            ratio,
            cap: self.config.session_cap,
            threshold: self.config.escalation_threshold,
            created_at: self.backends.clock.now(),
            status: EscalationStatus::Pending,
            reviewer: None,
            notes: None,
            resolved_at: None,
        };
        self.escalations.save(&record).await?;
        warn!(
            run_id = %run_id,
            escalation_id = %record.id,
            session_id = %request.session_id,
            ratio,
            threshold = self.config.escalation_threshold,
            "Budget threshold exceeded, escalating"
        );
        self.audit
            .log_action(
                Some(request.session_id.clone()),
                "orchestration.escalated",
                "orchestrator",
                serde_json::json!({
                    "run_id": run_id,
                    "escalation_id": record.id,
                    "ratio": ratio,
                }),
                AuditOutcome::Denied,
            )
            .await?;

        let outcome = OrchestrationOutcome {
            run_id,
            session_id: request.session_id.clone(),
            success: false,
            escalated: true,
            escalation_id: Some(record.id),
            message: format!(
                "Budget usage would reach {:.0}% of the session cap (threshold {:.0}%). \
                 Human approval is required before escalation {} can run.",
                ratio * 100.0,
                self.config.escalation_threshold * 100.0,
                record.id
            ),
            output: String::new(),
            ratio,
            delegations: decisions,
            executions: Vec::new(),
        };
        self.persist_audit(&request, &outcome, RunStage::Escalated, started_at)
            .await;
        Ok(outcome)
    }

    async fn execute_all(
        &self,
        run_id: Uuid,
        request: &OrchestrationRequest,
        context: &serde_json::Value,
        decisions: &[DelegationDecision],
    ) -> Vec<DelegationExecution> {
        join_all(
            decisions
                .iter()
                .map(|decision| self.execute_one(run_id, request, context, decision)),
        )
        .await
    }

    async fn execute_one(
        &self,
        run_id: Uuid,
        request: &OrchestrationRequest,
        context: &serde_json::Value,
        decision: &DelegationDecision,
    ) -> DelegationExecution {
        let agent_id = decision.agent_id.as_str();
        let profile = self.router.profile(agent_id);
        let sandbox_id =
            profile.map_or_else(|| format!("sandbox-{agent_id}"), AgentProfile::sandbox_id);
        let language = profile.map_or("python", |p| p.language.as_str());
        let timeout = self.config.sandbox_timeout();

        let payload = serde_json::json!({
            "run_id": run_id,
            "agent_id": agent_id,
            "session_id": request.session_id,
            "user_id": request.user_id,
            "query": request.query,
            "context": context,
        });

        self.monitor.start(agent_id).await;
        let started = Instant::now();
        let mut timed_out = false;
        let mut transient = false;
        let (success, output, error) = match snippet::render(language, &payload) {
            Err(e) => (false, String::new(), Some(e.to_string())),
            Ok(code) => {
                let sandbox_request = SandboxRequest {
                    sandbox_id: sandbox_id.clone(),
                    code,
                    language: language.to_string(),
                    timeout,
                    env: HashMap::from([
                        ("TOLLGATE_RUN_ID".to_string(), run_id.to_string()),
                        ("TOLLGATE_AGENT_ID".to_string(), agent_id.to_string()),
                        ("TOLLGATE_SESSION_ID".to_string(), request.session_id.clone()),
                    ]),
                };
                match tokio::time::timeout(timeout, self.backends.sandbox.execute(sandbox_request))
                    .await
                {
                    Ok(Ok(outcome)) => (outcome.success, outcome.output, outcome.error),
                    Ok(Err(e)) => {
                        transient = e.is_retryable();
                        (false, String::new(), Some(e.to_string()))
                    }
                    Err(_) => {
                        timed_out = true;
                        transient = true;
                        (
                            false,
                            String::new(),
                            Some(format!("sandbox timed out after {}s", timeout.as_secs())),
                        )
                    }
                }
            }
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let cost = decision.estimated_cost;
        let debited = match self.ledger.debit(agent_id, cost).await {
            Ok(_) => true,
            Err(e) => {
                error!(run_id = %run_id, agent_id, cost, error = %e, "Ledger debit failed");
                false
            }
        };
        self.monitor.finish(agent_id, success, latency_ms, cost).await;

        if success {
            info!(run_id = %run_id, agent_id, %sandbox_id, latency_ms, cost, "Delegation succeeded");
        } else {
            warn!(
                run_id = %run_id,
                agent_id,
                %sandbox_id,
                latency_ms,
                timed_out,
                transient,
                error = error.as_deref().unwrap_or("-"),
                "Delegation failed"
            );
        }

        DelegationExecution {
            agent_id: agent_id.to_string(),
            sandbox_id,
            success,
            output,
            error,
            cost,
            latency_ms,
            timed_out,
            transient,
            debited,
        }
    }

    fn aggregate(
        &self,
        run_id: Uuid,
        request: &OrchestrationRequest,
        delegations: Vec<DelegationDecision>,
        executions: Vec<DelegationExecution>,
        ratio: f64,
        escalation_id: Option<Uuid>,
    ) -> OrchestrationOutcome {
        let failed = executions.iter().filter(|e| !e.success).count();
        let success = !executions.is_empty() && failed == 0;
        let output = executions
            .iter()
            .filter(|e| e.success)
            .map(|e| format!("[{}]\n{}", e.agent_id, e.output.trim_end()))
            .collect::<Vec<_>>()
            .join("\n\n");
        let message = if success {
            format!("{} delegation(s) completed", executions.len())
        } else {
            format!("{failed} of {} delegation(s) failed", executions.len())
        };
        info!(run_id = %run_id, success, failed, "Orchestration finished");

        OrchestrationOutcome {
            run_id,
            session_id: request.session_id.clone(),
            success,
            escalated: false,
            escalation_id,
            message,
            output,
            ratio,
            delegations,
            executions,
        }
    }

    /// Write the run's audit document. A store failure is logged, never
    /// returned.
    async fn persist_audit(
        &self,
        request: &OrchestrationRequest,
        outcome: &OrchestrationOutcome,
        stage: RunStage,
        started_at: DateTime<Utc>,
    ) {
        let doc = OrchestrationAudit {
            id: outcome.run_id,
            session_id: request.session_id.clone(),
            user_id: request.user_id.clone(),
            query: request.query.clone(),
            stage,
            success: outcome.success,
            escalation_id: outcome.escalation_id,
            ratio: outcome.ratio,
            cap: self.config.session_cap,
            threshold: self.config.escalation_threshold,
            delegations: outcome.delegations.clone(),
            executions: outcome.executions.clone(),
            total_cost: outcome.executions.iter().map(|e| e.cost).sum(),
            started_at,
            finished_at: self.backends.clock.now(),
        };
        if let Err(e) = self
            .backends
            .store
            .set_as(ORCHESTRATION_AUDIT, &doc.id.to_string(), &doc)
            .await
        {
            error!(
                run_id = %outcome.run_id,
                stage = ?stage,
                error = %e,
                "Failed to persist orchestration audit"
            );
        }
    }
}
