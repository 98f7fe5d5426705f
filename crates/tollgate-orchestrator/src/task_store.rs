use crate::config::OrchestratorConfig;
use crate::router::CapabilityRouter;
use crate::spawner::{DelegationSpawner, RejectedDelegation};
use crate::types::{Task, TaskDispatch, TaskPayload, TaskResult, TaskStatus};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tollgate_core::collections::TASKS;
use tollgate_core::{
    Clock, DocumentStore, DocumentStoreExt, MessageQueue, Query, SortDirection, TollgateError,
    TollgateResult,
};
use tollgate_worker::JobEnvelope;
use tracing::{info, warn};
use uuid::Uuid;

/// Input to [`TaskStore::create_task`].
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Owning session.
    pub session_id: String,
    /// Owning conversation.
    pub conversation_id: String,
    /// What to do.
    pub payload: TaskPayload,
    /// Assigned agent; the router picks one when absent.
    pub agent_role: Option<String>,
    /// Parent task, for delegated work.
    pub parent_task_id: Option<Uuid>,
    /// Priority; the agent's default when absent.
    pub priority: Option<i32>,
    /// Initial metadata.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl NewTask {
    /// A root task for the router to assign.
    pub fn new(
        session_id: impl Into<String>,
        conversation_id: impl Into<String>,
        payload: TaskPayload,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            conversation_id: conversation_id.into(),
            payload,
            agent_role: None,
            parent_task_id: None,
            priority: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Assign an agent explicitly.
    pub fn with_agent_role(mut self, role: impl Into<String>) -> Self {
        self.agent_role = Some(role.into());
        self
    }

    /// Attach to a parent task.
    pub fn with_parent(mut self, parent_task_id: Uuid) -> Self {
        self.parent_task_id = Some(parent_task_id);
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Result of [`TaskStore::complete_task`].
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// The finished task.
    pub task: Task,
    /// Children spawned from its delegation requests.
    pub children: Vec<Task>,
    /// Delegation requests refused by the tree limits.
    pub rejected: Vec<RejectedDelegation>,
}

/// Task lifecycle over the `tasks` collection.
///
/// Delegated children are persisted with `dispatch_pending` set, published to
/// the task topic, and then unflagged. A crash in between leaves the flag set
/// for [`TaskStore::republish_pending_dispatches`] to pick up.
pub struct TaskStore {
    store: Arc<dyn DocumentStore>,
    queue: Arc<dyn MessageQueue>,
    router: Arc<CapabilityRouter>,
    spawner: DelegationSpawner,
    clock: Arc<dyn Clock>,
    task_topic: String,
}

impl TaskStore {
    /// Create a task store.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        queue: Arc<dyn MessageQueue>,
        router: Arc<CapabilityRouter>,
        clock: Arc<dyn Clock>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            queue,
            router,
            spawner: DelegationSpawner::new(config.limits()),
            clock,
            task_topic: config.task_topic.clone(),
        }
    }

    /// Topic tasks are dispatched on.
    pub fn task_topic(&self) -> &str {
        &self.task_topic
    }

    /// Persist a new pending task.
    pub async fn create_task(&self, new: NewTask) -> TollgateResult<Task> {
        if new.session_id.trim().is_empty() {
            return Err(TollgateError::Validation(
                "task session_id must not be empty".to_string(),
            ));
        }

        let depth = match new.parent_task_id {
            Some(parent_id) => {
                let parent = self
                    .get_task(parent_id)
                    .await?
                    .ok_or_else(|| TollgateError::NotFound {
                        collection: TASKS.to_string(),
                        id: parent_id.to_string(),
                    })?;
                parent.depth + 1
            }
            None => 0,
        };

        let agent_role = match new.agent_role {
            Some(role) => role,
            None => self.router.route_primary(&new.payload.content),
        };
        let priority = new.priority.unwrap_or_else(|| {
            self.router
                .profile(&agent_role)
                .map_or(5, |p| p.default_priority)
        });

        let task = Task {
            id: Uuid::new_v4(),
            session_id: new.session_id,
            conversation_id: new.conversation_id,
            agent_role,
            payload: new.payload,
            priority,
            status: TaskStatus::Pending,
            created_at: self.clock.now(),
            started_at: None,
            completed_at: None,
            parent_task_id: new.parent_task_id,
            result: None,
            metadata: new.metadata,
            depth,
            dispatch_pending: false,
        };
        self.save(&task).await?;
        info!(
            task_id = %task.id,
            session_id = %task.session_id,
            agent_role = %task.agent_role,
            priority = task.priority,
            "Task created"
        );
        Ok(task)
    }

    /// Look up a task.
    pub async fn get_task(&self, id: Uuid) -> TollgateResult<Option<Task>> {
        self.store.get_as(TASKS, &id.to_string()).await
    }

    async fn save(&self, task: &Task) -> TollgateResult<()> {
        self.store.set_as(TASKS, &task.id.to_string(), task).await
    }

    fn check_transition(task: &Task, allowed_from: &[TaskStatus], to: TaskStatus) -> TollgateResult<()> {
        if allowed_from.contains(&task.status) {
            Ok(())
        } else {
            Err(TollgateError::InvalidTransition {
                id: task.id.to_string(),
                from: task.status.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// Mark a pending task in progress.
    pub async fn start_task(&self, id: Uuid) -> TollgateResult<Option<Task>> {
        let Some(mut task) = self.get_task(id).await? else {
            return Ok(None);
        };
        Self::check_transition(&task, &[TaskStatus::Pending], TaskStatus::InProgress)?;
        task.status = TaskStatus::InProgress;
        task.started_at = Some(self.clock.now());
        self.save(&task).await?;
        info!(task_id = %id, agent_role = %task.agent_role, "Task started");
        Ok(Some(task))
    }

    /// Keep the result of a finished run on its in-progress task, so a
    /// redelivered dispatch can complete the task without running it again.
    pub async fn record_result(&self, id: Uuid, result: &TaskResult) -> TollgateResult<()> {
        let partial = serde_json::json!({ "result": serde_json::to_value(result)? });
        self.store.update(TASKS, &id.to_string(), partial).await
    }

    /// Finish an in-progress task and spawn its delegations.
    ///
    /// Children are written, flagged `dispatch_pending`, before the task's
    /// terminal status. An interrupted completion leaves the task in progress,
    /// and calling again picks up the children already written instead of
    /// creating them twice.
    pub async fn complete_task(
        &self,
        id: Uuid,
        result: TaskResult,
    ) -> TollgateResult<Option<Completion>> {
        let Some(mut task) = self.get_task(id).await? else {
            return Ok(None);
        };
        let status = if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        Self::check_transition(&task, &[TaskStatus::InProgress], status)?;

        let now = self.clock.now();
        let requests = result.delegate_to.clone();
        task.status = status;
        task.completed_at = Some(now);
        task.result = Some(result);

        let mut written: HashMap<Uuid, Task> = HashMap::new();
        let mut existing = 0;
        if !requests.is_empty() {
            let ours: HashSet<Uuid> = (0..requests.len())
                .map(|index| DelegationSpawner::child_id(id, index))
                .collect();
            for child in self.children_of(id).await? {
                if ours.contains(&child.id) {
                    written.insert(child.id, child);
                } else {
                    existing += 1;
                }
            }
        }
        let (accepted, rejected) = self.spawner.plan(&task, existing, requests);
        if !rejected.is_empty() {
            let previous = task
                .metadata
                .get("rejected_delegations")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0);
            task.metadata.insert(
                "rejected_delegations".to_string(),
                serde_json::Value::from(previous + rejected.len() as u64),
            );
        }

        let mut children = Vec::with_capacity(accepted.len());
        for (index, request) in accepted.into_iter().enumerate() {
            if let Some(child) = written.remove(&DelegationSpawner::child_id(id, index)) {
                children.push(child);
                continue;
            }
            let default_priority = self
                .router
                .profile(&request.target_role)
                .map(|p| p.default_priority);
            let child = self
                .spawner
                .build_child(&task, index, request, default_priority, now);
            self.save(&child).await?;
            children.push(child);
        }

        self.save(&task).await?;
        info!(
            task_id = %id,
            status = %task.status,
            delegations = children.len(),
            rejected = rejected.len(),
            "Task finished"
        );

        for child in children.iter_mut().filter(|c| c.dispatch_pending) {
            match self.dispatch(child).await {
                Ok(()) => child.dispatch_pending = false,
                Err(e) => warn!(
                    task_id = %child.id,
                    parent_task_id = %id,
                    error = %e,
                    "Child dispatch failed; left for republish sweep"
                ),
            }
        }

        Ok(Some(Completion {
            task,
            children,
            rejected,
        }))
    }

    /// Cancel a pending or in-progress task.
    pub async fn cancel_task(&self, id: Uuid) -> TollgateResult<Option<Task>> {
        let Some(mut task) = self.get_task(id).await? else {
            return Ok(None);
        };
        Self::check_transition(
            &task,
            &[TaskStatus::Pending, TaskStatus::InProgress],
            TaskStatus::Cancelled,
        )?;
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(self.clock.now());
        self.save(&task).await?;
        info!(task_id = %id, "Task cancelled");
        Ok(Some(task))
    }

    /// A session's tasks, oldest first, optionally filtered by status.
    pub async fn get_session_tasks(
        &self,
        session_id: &str,
        status: Option<TaskStatus>,
    ) -> TollgateResult<Vec<Task>> {
        let mut query = Query::new().where_eq("session_id", session_id);
        if let Some(status) = status {
            query = query.where_eq("status", status.as_str());
        }
        let query = query.order_by("created_at", SortDirection::Asc);
        self.store.query_as(TASKS, &query).await
    }

    /// Pending tasks for an agent, highest priority first, then oldest.
    pub async fn get_pending_tasks_for_agent(
        &self,
        agent_role: &str,
        limit: usize,
    ) -> TollgateResult<Vec<Task>> {
        let query = Query::new()
            .where_eq("agent_role", agent_role)
            .where_eq("status", TaskStatus::Pending.as_str())
            .order_by("priority", SortDirection::Desc)
            .order_by("created_at", SortDirection::Asc)
            .limit(limit);
        self.store.query_as(TASKS, &query).await
    }

    /// Direct children of a task, oldest first.
    pub async fn children_of(&self, parent_id: Uuid) -> TollgateResult<Vec<Task>> {
        let query = Query::new()
            .where_eq("parent_task_id", parent_id.to_string())
            .order_by("created_at", SortDirection::Asc);
        self.store.query_as(TASKS, &query).await
    }

    /// Publish a task to the task topic and clear its `dispatch_pending`
    /// flag. The job id is the task id, so consumers can drop duplicates.
    pub async fn dispatch(&self, task: &Task) -> TollgateResult<()> {
        let body = TaskDispatch {
            task_id: task.id,
            agent_role: task.agent_role.clone(),
        };
        let correlation = task
            .parent_task_id
            .map_or_else(|| task.id.to_string(), |p| p.to_string());
        let envelope = JobEnvelope::new("task-store", serde_json::to_value(&body)?)
            .with_job_id(task.id.to_string())
            .with_correlation_id(correlation)
            .with_priority(task.priority);
        self.queue
            .publish(&self.task_topic, serde_json::to_value(&envelope)?, HashMap::new())
            .await?;
        if task.dispatch_pending {
            self.store
                .update(
                    TASKS,
                    &task.id.to_string(),
                    serde_json::json!({ "dispatch_pending": false }),
                )
                .await?;
        }
        info!(task_id = %task.id, topic = %self.task_topic, "Task dispatched");
        Ok(())
    }

    /// Publish every pending task still flagged `dispatch_pending`. Returns
    /// how many were published. Safe to run repeatedly.
    pub async fn republish_pending_dispatches(&self) -> TollgateResult<usize> {
        let query = Query::new()
            .where_eq("dispatch_pending", true)
            .where_eq("status", TaskStatus::Pending.as_str())
            .order_by("created_at", SortDirection::Asc);
        let stranded: Vec<Task> = self.store.query_as(TASKS, &query).await?;
        let mut published = 0;
        for task in &stranded {
            self.dispatch(task).await?;
            published += 1;
        }
        if published > 0 {
            info!(count = published, "Republished stranded task dispatches");
        }
        Ok(published)
    }
}
