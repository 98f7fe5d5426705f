#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tollgate_backends::{FileDocumentStore, MemoryDocumentStore, MemoryQueue};
use tollgate_core::collections::{ORCHESTRATION_AUDIT, TASKS};
use tollgate_core::{
    DocumentStore, DocumentStoreExt, ManualClock, Query, Sandbox, SandboxOutcome, SandboxRequest,
    TollgateError, TollgateResult,
};
use tollgate_orchestrator::{
    AgentProfile, Backends, BudgetLedger, DelegationRequest, EscalationStatus, NewTask,
    OrchestrationAudit, OrchestrationRequest, Orchestrator, OrchestratorConfig, RunStage,
    TaskDispatchWorker, TaskPayload, TaskResult, TaskStatus,
};
use tollgate_worker::{RetryPolicy, WorkerConfig, WorkerRunner};

/// Records every request. Sandboxes listed in `failing` report failure,
/// those in `hanging` never return, those in `unreachable` fail at the
/// service level, and `replies` overrides the output.
#[derive(Default)]
struct ScriptedSandbox {
    calls: AtomicUsize,
    requests: Mutex<Vec<SandboxRequest>>,
    failing: Vec<String>,
    hanging: Vec<String>,
    unreachable: Vec<String>,
    replies: HashMap<String, String>,
}

impl ScriptedSandbox {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn execute(&self, request: SandboxRequest) -> TollgateResult<SandboxOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = request.sandbox_id.clone();
        self.requests.lock().push(request);
        if self.hanging.contains(&id) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.unreachable.contains(&id) {
            return Err(TollgateError::Sandbox("503 service unavailable".into()));
        }
        if self.failing.contains(&id) {
            return Ok(SandboxOutcome::failure("agent crashed", 3));
        }
        let output = self
            .replies
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("{id} done"));
        Ok(SandboxOutcome::success(output, 3))
    }
}

/// Memory store that can be armed to fail one upcoming write.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryDocumentStore,
    armed: Mutex<Option<(String, usize)>>,
}

impl FaultyStore {
    /// Fail the `nth` next `set` on `collection`, counting from 1.
    fn fail_write(&self, collection: &str, nth: usize) {
        *self.armed.lock() = Some((collection.to_string(), nth));
    }

    fn trips(&self, collection: &str) -> bool {
        let mut armed = self.armed.lock();
        let Some((target, remaining)) = armed.as_mut() else {
            return false;
        };
        if target.as_str() != collection {
            return false;
        }
        *remaining -= 1;
        let fire = *remaining == 0;
        if fire {
            *armed = None;
        }
        fire
    }
}

#[async_trait]
impl DocumentStore for FaultyStore {
    async fn get(&self, collection: &str, id: &str) -> TollgateResult<Option<serde_json::Value>> {
        self.inner.get(collection, id).await
    }

    async fn set(&self, collection: &str, id: &str, doc: serde_json::Value) -> TollgateResult<()> {
        if self.trips(collection) {
            return Err(TollgateError::Store(format!("write to {collection} refused")));
        }
        self.inner.set(collection, id, doc).await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        partial: serde_json::Value,
    ) -> TollgateResult<()> {
        self.inner.update(collection, id, partial).await
    }

    async fn query(&self, collection: &str, query: &Query) -> TollgateResult<Vec<serde_json::Value>> {
        self.inner.query(collection, query).await
    }
}

fn profiles() -> Vec<AgentProfile> {
    [
        json!({"id": "research", "keywords": ["research"], "base_cost": 10.0, "default_priority": 6}),
        json!({"id": "code", "keywords": ["code"], "base_cost": 2.0, "default_priority": 7}),
        json!({"id": "general", "base_cost": 1.0}),
    ]
    .into_iter()
    .map(|p| serde_json::from_value(p).unwrap())
    .collect()
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    store: Arc<FaultyStore>,
    queue: Arc<MemoryQueue>,
    sandbox: Arc<ScriptedSandbox>,
    clock: Arc<ManualClock>,
}

fn harness_with(sandbox: ScriptedSandbox, config: OrchestratorConfig) -> Harness {
    let store = Arc::new(FaultyStore::default());
    let queue = Arc::new(MemoryQueue::new());
    let sandbox = Arc::new(sandbox);
    let clock = Arc::new(ManualClock::default());
    let backends = Backends {
        store: store.clone(),
        queue: queue.clone(),
        sandbox: sandbox.clone(),
        clock: clock.clone(),
    };
    let orchestrator = Arc::new(Orchestrator::new(config, profiles(), backends).unwrap());
    Harness {
        orchestrator,
        store,
        queue,
        sandbox,
        clock,
    }
}

fn harness() -> Harness {
    harness_with(ScriptedSandbox::default(), OrchestratorConfig::default())
}

fn request(query: &str) -> OrchestrationRequest {
    OrchestrationRequest {
        session_id: "s1".into(),
        user_id: "u1".into(),
        query: query.into(),
        context: json!({"locale": "en"}),
    }
}

fn delegation(target: &str, content: &str) -> DelegationRequest {
    DelegationRequest {
        target_role: target.into(),
        intent: "follow_up".into(),
        payload: json!(content),
        priority: None,
        wait_for_result: false,
    }
}

// ---------------------------------------------------------------------------
// Task store
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_create_task_assigns_routed_agent() {
    let h = harness();
    let tasks = h.orchestrator.tasks();
    let task = tasks
        .create_task(NewTask::new("s1", "c1", TaskPayload::new("build", "please write code")))
        .await
        .unwrap();
    assert_eq!(task.agent_role, "code");
    assert_eq!(task.priority, 7);
    assert_eq!(task.status, TaskStatus::Pending);

    let stored = tasks.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.agent_role, "code");

    let fallback = tasks
        .create_task(NewTask::new("s1", "c1", TaskPayload::new("chat", "good morning")))
        .await
        .unwrap();
    assert_eq!(fallback.agent_role, "general");
}

#[tokio::test]
async fn test_task_round_trip_keeps_absent_fields_absent() {
    let h = harness();
    let tasks = h.orchestrator.tasks();
    let task = tasks
        .create_task(
            NewTask::new("s1", "c1", TaskPayload::new("ask", "anything"))
                .with_agent_role("general")
                .with_metadata("origin", json!("api")),
        )
        .await
        .unwrap();

    let first = tasks.get_task(task.id).await.unwrap().unwrap();
    let second = tasks.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(first, task);

    let raw = h.store.get(TASKS, &task.id.to_string()).await.unwrap().unwrap();
    for absent in ["result", "started_at", "completed_at", "parent_task_id"] {
        assert!(raw.get(absent).is_none(), "{absent} should not be stored");
    }
    assert_eq!(raw["metadata"]["origin"], json!("api"));
}

#[tokio::test]
async fn test_unknown_task_is_none() {
    let h = harness();
    let tasks = h.orchestrator.tasks();
    let id = uuid::Uuid::new_v4();
    assert!(tasks.get_task(id).await.unwrap().is_none());
    assert!(tasks.start_task(id).await.unwrap().is_none());
    assert!(tasks
        .complete_task(id, TaskResult::success(json!("x")))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_child_of_unknown_parent_is_rejected() {
    let h = harness();
    let err = h
        .orchestrator
        .tasks()
        .create_task(
            NewTask::new("s1", "c1", TaskPayload::new("ask", "x")).with_parent(uuid::Uuid::new_v4()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TollgateError::NotFound { .. }));
}

#[tokio::test]
async fn test_complete_task_spawns_and_dispatches_children() {
    let h = harness();
    let tasks = h.orchestrator.tasks();
    let parent = tasks
        .create_task(NewTask::new("s1", "c1", TaskPayload::new("plan", "research the topic")))
        .await
        .unwrap();
    tasks.start_task(parent.id).await.unwrap();

    let result = TaskResult::success(json!("plan ready")).with_delegations(vec![
        delegation("code", "write a parser"),
        delegation("code", "write tests"),
        delegation("general", "tell the user"),
    ]);
    let completion = tasks.complete_task(parent.id, result).await.unwrap().unwrap();
    assert_eq!(completion.task.status, TaskStatus::Completed);
    assert_eq!(completion.children.len(), 3);
    assert!(completion.rejected.is_empty());

    for child in &completion.children {
        assert_eq!(child.parent_task_id, Some(parent.id));
        assert_eq!(child.metadata["delegated_from"], json!("research"));
        assert_eq!(child.depth, 1);
        assert!(!child.dispatch_pending);
        let stored = tasks.get_task(child.id).await.unwrap().unwrap();
        assert!(!stored.dispatch_pending);
        assert_eq!(stored.status, TaskStatus::Pending);
    }
    assert_eq!(completion.children[0].payload.content, "write a parser");
    assert_eq!(completion.children[0].priority, 7);
    assert_eq!(h.queue.depth("agent-tasks"), 3);
    assert_eq!(tasks.children_of(parent.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_fan_out_limit_rejects_excess_delegations() {
    let h = harness();
    let tasks = h.orchestrator.tasks();
    let parent = tasks
        .create_task(NewTask::new("s1", "c1", TaskPayload::new("plan", "x")).with_agent_role("general"))
        .await
        .unwrap();
    tasks.start_task(parent.id).await.unwrap();

    let requests = (0..7).map(|i| delegation("code", &format!("part {i}"))).collect();
    let completion = tasks
        .complete_task(parent.id, TaskResult::success(json!(null)).with_delegations(requests))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completion.children.len(), 5);
    assert_eq!(completion.rejected.len(), 2);
    assert_eq!(completion.task.metadata["rejected_delegations"], json!(2));
}

#[tokio::test]
async fn test_interrupted_completion_keeps_every_delegation() {
    let h = harness();
    let tasks = h.orchestrator.tasks();
    let parent = tasks
        .create_task(NewTask::new("s1", "c1", TaskPayload::new("plan", "research the topic")))
        .await
        .unwrap();
    tasks.start_task(parent.id).await.unwrap();
    let result = TaskResult::success(json!("plan ready")).with_delegations(vec![
        delegation("code", "write a parser"),
        delegation("code", "write tests"),
        delegation("general", "tell the user"),
    ]);

    // The second child write fails.
    h.store.fail_write(TASKS, 2);
    let err = tasks.complete_task(parent.id, result.clone()).await.unwrap_err();
    assert!(err.is_retryable());
    let stored = tasks.get_task(parent.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::InProgress);
    assert_eq!(tasks.children_of(parent.id).await.unwrap().len(), 1);
    assert_eq!(h.queue.depth("agent-tasks"), 0);

    let completion = tasks.complete_task(parent.id, result).await.unwrap().unwrap();
    assert_eq!(completion.task.status, TaskStatus::Completed);
    let contents: Vec<&str> = completion
        .children
        .iter()
        .map(|c| c.payload.content.as_str())
        .collect();
    assert_eq!(contents, ["write a parser", "write tests", "tell the user"]);
    assert_eq!(tasks.children_of(parent.id).await.unwrap().len(), 3);
    assert_eq!(h.queue.depth("agent-tasks"), 3);
    assert!(completion.children.iter().all(|c| !c.dispatch_pending));
}

#[tokio::test]
async fn test_invalid_transitions_are_rejected() {
    let h = harness();
    let tasks = h.orchestrator.tasks();
    let task = tasks
        .create_task(NewTask::new("s1", "c1", TaskPayload::new("ask", "x")).with_agent_role("general"))
        .await
        .unwrap();

    let err = tasks
        .complete_task(task.id, TaskResult::success(json!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, TollgateError::InvalidTransition { .. }));

    tasks.start_task(task.id).await.unwrap();
    assert!(tasks.start_task(task.id).await.is_err());

    tasks
        .complete_task(task.id, TaskResult::failure("nope"))
        .await
        .unwrap();
    let stored = tasks.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(tasks.cancel_task(task.id).await.is_err());
}

#[tokio::test]
async fn test_cancel_pending_task() {
    let h = harness();
    let tasks = h.orchestrator.tasks();
    let task = tasks
        .create_task(NewTask::new("s1", "c1", TaskPayload::new("ask", "x")).with_agent_role("general"))
        .await
        .unwrap();
    let cancelled = tasks.cancel_task(task.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
}

#[tokio::test]
async fn test_session_and_agent_queries() {
    let h = harness();
    let tasks = h.orchestrator.tasks();
    for (priority, session) in [(1, "s1"), (9, "s1"), (5, "s2")] {
        tasks
            .create_task(
                NewTask::new(session, "c1", TaskPayload::new("ask", "x"))
                    .with_agent_role("code")
                    .with_priority(priority),
            )
            .await
            .unwrap();
        h.clock.advance(chrono::Duration::seconds(1));
    }

    assert_eq!(tasks.get_session_tasks("s1", None).await.unwrap().len(), 2);
    assert!(tasks
        .get_session_tasks("s1", Some(TaskStatus::Completed))
        .await
        .unwrap()
        .is_empty());

    let pending = tasks.get_pending_tasks_for_agent("code", 2).await.unwrap();
    let priorities: Vec<i32> = pending.iter().map(|t| t.priority).collect();
    assert_eq!(priorities, vec![9, 5]);
}

#[tokio::test]
async fn test_republish_sweep_picks_up_stranded_children() {
    let h = harness();
    let tasks = h.orchestrator.tasks();
    let task = tasks
        .create_task(NewTask::new("s1", "c1", TaskPayload::new("ask", "x")).with_agent_role("code"))
        .await
        .unwrap();
    // Simulate a crash between persisting and publishing.
    h.store
        .update(TASKS, &task.id.to_string(), json!({"dispatch_pending": true}))
        .await
        .unwrap();

    assert_eq!(tasks.republish_pending_dispatches().await.unwrap(), 1);
    assert_eq!(h.queue.depth("agent-tasks"), 1);
    assert!(!tasks.get_task(task.id).await.unwrap().unwrap().dispatch_pending);
    assert_eq!(tasks.republish_pending_dispatches().await.unwrap(), 0);

    let message = &h.queue.peek("agent-tasks")[0];
    assert_eq!(message.payload["job_id"], json!(task.id.to_string()));
    assert_eq!(message.payload["payload"]["agent_role"], json!("code"));
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_debits_are_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileDocumentStore::new(dir.path().to_path_buf()).await.unwrap();
    let ledger = Arc::new(BudgetLedger::new(
        Arc::new(store),
        Arc::new(ManualClock::default()),
        100.0,
    ));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let ledger = Arc::clone(&ledger);
        handles.push(tokio::spawn(async move {
            ledger.debit("research", 1.5).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let entry = ledger.entry("research").await.unwrap();
    assert!((entry.spent - 30.0).abs() < 1e-9);
    assert!((entry.available() - 70.0).abs() < 1e-9);
}

// ---------------------------------------------------------------------------
// Orchestration runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_run_under_threshold_executes_and_audits() {
    let h = harness();
    let outcome = h.orchestrator.run(request("research the history of tolls")).await.unwrap();

    assert!(outcome.success);
    assert!(!outcome.escalated);
    assert!((outcome.ratio - 0.1).abs() < 1e-9);
    assert_eq!(outcome.executions.len(), 1);
    assert_eq!(outcome.executions[0].sandbox_id, "sandbox-research");
    assert!(outcome.output.contains("[research]"));
    assert_eq!(h.sandbox.calls(), 1);

    let entry = h.orchestrator.ledger().entry("research").await.unwrap();
    assert!((entry.spent - 10.0).abs() < 1e-9);

    let audit: OrchestrationAudit = h
        .store
        .get_as(ORCHESTRATION_AUDIT, &outcome.run_id.to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(audit.stage, RunStage::Executed);
    assert!((audit.total_cost - 10.0).abs() < 1e-9);

    let metrics = h.orchestrator.monitor().aggregate_metrics().await;
    assert_eq!(metrics.delegations, 1);
}

#[tokio::test]
async fn test_run_rejects_empty_query() {
    let h = harness();
    let err = h.orchestrator.run(request("   ")).await.unwrap_err();
    assert!(matches!(err, TollgateError::Validation(_)));
    assert_eq!(h.sandbox.calls(), 0);
}

#[tokio::test]
async fn test_unmatched_query_uses_default_agent() {
    let h = harness();
    let outcome = h.orchestrator.run(request("good morning")).await.unwrap();
    assert_eq!(outcome.delegations.len(), 1);
    assert_eq!(outcome.delegations[0].agent_id, "general");
    assert!((outcome.delegations[0].estimated_cost - 1.0).abs() < 1e-9);
    assert!(outcome.success);
}

#[tokio::test]
async fn test_over_threshold_escalates_without_executing() {
    let h = harness();
    h.orchestrator.ledger().debit("research", 75.0).await.unwrap();

    let outcome = h.orchestrator.run(request("research everything")).await.unwrap();
    assert!(outcome.escalated);
    assert!(!outcome.success);
    assert!((outcome.ratio - 0.85).abs() < 1e-9);
    assert!(outcome.executions.is_empty());
    assert!(outcome.message.contains("approval"));
    assert_eq!(h.sandbox.calls(), 0);

    let pending = h.orchestrator.escalations().list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(Some(pending[0].id), outcome.escalation_id);
    assert_eq!(pending[0].delegations[0].agent_id, "research");

    let entry = h.orchestrator.ledger().entry("research").await.unwrap();
    assert!((entry.spent - 75.0).abs() < 1e-9);

    let audit: OrchestrationAudit = h
        .store
        .get_as(ORCHESTRATION_AUDIT, &outcome.run_id.to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(audit.stage, RunStage::Escalated);
}

#[tokio::test]
async fn test_ratio_at_threshold_does_not_escalate() {
    let h = harness();
    h.orchestrator.ledger().debit("research", 70.0).await.unwrap();
    let outcome = h.orchestrator.run(request("research it")).await.unwrap();
    assert!(!outcome.escalated);
    assert!((outcome.ratio - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn test_resume_requires_approval_and_runs_once() {
    let h = harness();
    h.orchestrator.ledger().debit("research", 75.0).await.unwrap();
    let outcome = h.orchestrator.run(request("research everything")).await.unwrap();
    let id = outcome.escalation_id.unwrap();

    let err = h.orchestrator.resume_escalation(id).await.unwrap_err();
    assert!(matches!(err, TollgateError::InvalidTransition { .. }));

    h.orchestrator
        .escalations()
        .approve(id, "ops", Some("within quarterly budget".into()))
        .await
        .unwrap();
    let resumed = h.orchestrator.resume_escalation(id).await.unwrap();
    assert!(resumed.success);
    assert_eq!(resumed.escalation_id, Some(id));
    assert_eq!(h.sandbox.calls(), 1);

    let record = h.orchestrator.escalations().get(id).await.unwrap().unwrap();
    assert_eq!(record.status, EscalationStatus::Resumed);
    let entry = h.orchestrator.ledger().entry("research").await.unwrap();
    assert!((entry.spent - 85.0).abs() < 1e-9);

    assert!(h.orchestrator.resume_escalation(id).await.is_err());
    assert_eq!(h.sandbox.calls(), 1);
}

#[tokio::test]
async fn test_partial_success_is_aggregated() {
    let sandbox = ScriptedSandbox {
        failing: vec!["sandbox-code".into()],
        ..Default::default()
    };
    let h = harness_with(sandbox, OrchestratorConfig::default());

    let outcome = h
        .orchestrator
        .run(request("research the api and write code for it"))
        .await
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.executions.len(), 2);
    assert!(outcome.output.contains("[research]"));
    assert!(!outcome.output.contains("[code]"));
    assert!(outcome.message.starts_with("1 of 2"));

    let code = outcome.executions.iter().find(|e| e.agent_id == "code").unwrap();
    assert_eq!(code.error.as_deref(), Some("agent crashed"));
    assert!(code.debited);
    let entry = h.orchestrator.ledger().entry("code").await.unwrap();
    assert!((entry.spent - 2.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_timed_out_delegation_is_still_debited() {
    let sandbox = ScriptedSandbox {
        hanging: vec!["sandbox-research".into()],
        ..Default::default()
    };
    let config = OrchestratorConfig {
        sandbox_timeout_secs: 1,
        ..OrchestratorConfig::default()
    };
    let h = harness_with(sandbox, config);

    let outcome = h.orchestrator.run(request("research slowly")).await.unwrap();
    let execution = &outcome.executions[0];
    assert!(!execution.success);
    assert!(execution.timed_out);
    assert!(execution.debited);

    let entry = h.orchestrator.ledger().entry("research").await.unwrap();
    assert!((entry.spent - 10.0).abs() < 1e-9);
    let state = h.orchestrator.monitor().get_state("research").await.unwrap();
    assert_eq!(state.metrics.errors, 1);
}

#[tokio::test]
async fn test_audit_write_failure_keeps_outcome() {
    let h = harness();
    h.store.fail_write(ORCHESTRATION_AUDIT, 1);

    let outcome = h.orchestrator.run(request("research the market")).await.unwrap();
    assert!(outcome.success);
    assert!(outcome.output.contains("sandbox-research done"));
    assert!(h
        .store
        .get(ORCHESTRATION_AUDIT, &outcome.run_id.to_string())
        .await
        .unwrap()
        .is_none());
    let entry = h.orchestrator.ledger().entry("research").await.unwrap();
    assert!((entry.spent - 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_context_includes_recent_session_outputs() {
    let h = harness();
    let tasks = h.orchestrator.tasks();
    let task = tasks
        .create_task(NewTask::new("s1", "c1", TaskPayload::new("ask", "x")).with_agent_role("general"))
        .await
        .unwrap();
    tasks.start_task(task.id).await.unwrap();
    tasks
        .complete_task(task.id, TaskResult::success(json!("earlier finding")))
        .await
        .unwrap();

    h.orchestrator.run(request("research more")).await.unwrap();
    let requests = h.sandbox.requests.lock();
    assert!(requests[0].code.contains("earlier finding"));
    assert!(requests[0].code.contains("locale"));
    assert_eq!(requests[0].timeout, Duration::from_secs(30));
}

// ---------------------------------------------------------------------------
// Task dispatch worker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dispatch_worker_runs_tasks_and_fans_out() {
    let sandbox = ScriptedSandbox {
        replies: HashMap::from([(
            "sandbox-research".to_string(),
            json!({"delegate_to": [{"target_role": "code", "intent": "build", "payload": "write the code"}]})
                .to_string(),
        )]),
        ..Default::default()
    };
    let h = harness_with(sandbox, OrchestratorConfig::default());
    let tasks = h.orchestrator.tasks();

    let root = tasks
        .create_task(NewTask::new("s1", "c1", TaskPayload::new("study", "research compilers")))
        .await
        .unwrap();
    tasks.dispatch(&root).await.unwrap();

    let runner = WorkerRunner::new(
        Arc::new(TaskDispatchWorker::new(Arc::clone(&h.orchestrator))),
        WorkerConfig::new("agent-tasks"),
        h.queue.clone(),
        h.clock.clone(),
    );

    let report = runner.poll_once().await.unwrap();
    assert_eq!(report.completed, 1);
    let root = tasks.get_task(root.id).await.unwrap().unwrap();
    assert_eq!(root.status, TaskStatus::Completed);
    let children = tasks.children_of(root.id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].agent_role, "code");
    assert_eq!(h.queue.depth("agent-tasks"), 1);

    let report = runner.poll_once().await.unwrap();
    assert_eq!(report.completed, 1);
    let child = tasks.get_task(children[0].id).await.unwrap().unwrap();
    assert_eq!(child.status, TaskStatus::Completed);
    assert_eq!(h.sandbox.calls(), 2);

    // A redelivered dispatch is acknowledged without running again.
    tasks.dispatch(&root).await.unwrap();
    let report = runner.poll_once().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(h.sandbox.calls(), 2);
}

#[tokio::test]
async fn test_dispatch_worker_dead_letters_failed_task() {
    let sandbox = ScriptedSandbox {
        failing: vec!["sandbox-code".into()],
        ..Default::default()
    };
    let h = harness_with(sandbox, OrchestratorConfig::default());
    let tasks = h.orchestrator.tasks();
    let task = tasks
        .create_task(NewTask::new("s1", "c1", TaskPayload::new("build", "code it")))
        .await
        .unwrap();
    tasks.dispatch(&task).await.unwrap();

    let runner = WorkerRunner::new(
        Arc::new(TaskDispatchWorker::new(Arc::clone(&h.orchestrator))),
        WorkerConfig::new("agent-tasks"),
        h.queue.clone(),
        h.clock.clone(),
    );
    let report = runner.poll_once().await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(h.queue.depth("dead-letters"), 1);

    let stored = tasks.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.result.unwrap().error.as_deref(), Some("1 of 1 delegation(s) failed"));
}

fn dispatch_runner(h: &Harness, retry: RetryPolicy) -> WorkerRunner<TaskDispatchWorker> {
    WorkerRunner::new(
        Arc::new(
            TaskDispatchWorker::new(Arc::clone(&h.orchestrator)).with_retry_policy(retry.clone()),
        ),
        WorkerConfig::new("agent-tasks"),
        h.queue.clone(),
        h.clock.clone(),
    )
    .with_retry_policy(retry)
}

#[tokio::test]
async fn test_dispatch_worker_retries_unreachable_sandbox() {
    let sandbox = ScriptedSandbox {
        unreachable: vec!["sandbox-code".into()],
        ..Default::default()
    };
    let h = harness_with(sandbox, OrchestratorConfig::default());
    let tasks = h.orchestrator.tasks();
    let task = tasks
        .create_task(NewTask::new("s1", "c1", TaskPayload::new("build", "code it")))
        .await
        .unwrap();
    tasks.dispatch(&task).await.unwrap();
    let runner = dispatch_runner(&h, RetryPolicy::immediate(3));

    for attempt in 1..=3 {
        let report = runner.poll_once().await.unwrap();
        assert_eq!(report.retried, 1, "attempt {attempt}");
        let stored = tasks.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
    }
    let report = runner.poll_once().await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(h.sandbox.calls(), 4);

    let dead = h.queue.peek("dead-letters");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload["payload"]["failure"]["failure_count"], json!(4));

    let stored = tasks.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    // Every attempt is charged.
    let entry = h.orchestrator.ledger().entry("code").await.unwrap();
    assert!((entry.spent - 8.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_dispatch_worker_finishes_interrupted_completion() {
    let h = harness();
    let tasks = h.orchestrator.tasks();
    let task = tasks
        .create_task(NewTask::new("s1", "c1", TaskPayload::new("build", "code it")))
        .await
        .unwrap();
    tasks.dispatch(&task).await.unwrap();
    let runner = dispatch_runner(&h, RetryPolicy::immediate(3));

    // Write 1 starts the task; write 2 is its terminal status.
    h.store.fail_write(TASKS, 2);
    let report = runner.poll_once().await.unwrap();
    assert_eq!(report.retried, 1);
    let stored = tasks.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::InProgress);
    assert!(stored.result.is_some());

    let report = runner.poll_once().await.unwrap();
    assert_eq!(report.completed, 1);
    let stored = tasks.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    let output = stored.result.unwrap().output;
    assert!(output["output"].as_str().unwrap().contains("sandbox-code done"));

    // The run itself happened once.
    assert_eq!(h.sandbox.calls(), 1);
    let entry = h.orchestrator.ledger().entry("code").await.unwrap();
    assert!((entry.spent - 2.0).abs() < 1e-9);
}
