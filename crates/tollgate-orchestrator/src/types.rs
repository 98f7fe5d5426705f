use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identifier of an agent (also its role name), e.g. `research`.
pub type AgentId = String;

/// Configuration for a specialized agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Agent id; tasks store it as their `agent_role`.
    pub id: AgentId,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Capability names the agent offers, e.g. `web_search`.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Extra routing keywords.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Priority given to tasks routed to this agent.
    #[serde(default = "default_priority")]
    pub default_priority: i32,
    /// Estimated cost of one delegation to this agent.
    #[serde(default = "default_cost")]
    pub base_cost: f64,
    /// Sandbox bound to this agent. Defaults to `sandbox-<id>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    /// Language the agent's snippets are rendered in.
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_priority() -> i32 {
    5
}

fn default_cost() -> f64 {
    1.0
}

fn default_language() -> String {
    "python".to_string()
}

impl AgentProfile {
    /// Sandbox this agent executes in.
    pub fn sandbox_id(&self) -> String {
        self.sandbox_id
            .clone()
            .unwrap_or_else(|| format!("sandbox-{}", self.id))
    }
}

/// Lifecycle status of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet picked up.
    Pending,
    /// Picked up by an agent.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl TaskStatus {
    /// The stored string form, usable in query filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no further transitions are allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file or blob referenced by a task payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Display name.
    pub name: String,
    /// Where the content lives.
    pub uri: String,
    /// MIME type, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// What a task asks an agent to do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Short intent label, e.g. `summarize`.
    pub intent: String,
    /// Free-text request; the router matches against it.
    pub content: String,
    /// Referenced files.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Caller-supplied context.
    #[serde(default)]
    pub context: serde_json::Value,
    /// Intent-specific parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl TaskPayload {
    /// A payload with just an intent and content.
    pub fn new(intent: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            content: content.into(),
            ..Self::default()
        }
    }
}

/// A request to dispatch a sub-task to another agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRequest {
    /// Agent that should handle the sub-task.
    pub target_role: AgentId,
    /// Intent of the sub-task.
    pub intent: String,
    /// Sub-task payload. A string becomes the content; an object may carry
    /// `content`, `context` and `parameters`.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Priority override; the target's default priority otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Whether the delegating agent waits on the sub-task's result.
    #[serde(default)]
    pub wait_for_result: bool,
}

/// The outcome an agent reports when finishing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Whether the task succeeded.
    pub success: bool,
    /// Agent output.
    #[serde(default)]
    pub output: serde_json::Value,
    /// Error text when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Sub-tasks to spawn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegate_to: Vec<DelegationRequest>,
}

impl TaskResult {
    /// A successful result without delegations.
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            delegate_to: Vec::new(),
        }
    }

    /// A failed result.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            delegate_to: Vec::new(),
        }
    }

    /// Attach delegation requests.
    pub fn with_delegations(mut self, delegate_to: Vec<DelegationRequest>) -> Self {
        self.delegate_to = delegate_to;
        self
    }
}

/// A unit of agent work, persisted in the `tasks` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub id: Uuid,
    /// Owning session.
    pub session_id: String,
    /// Owning conversation.
    pub conversation_id: String,
    /// Agent assigned to the task.
    pub agent_role: AgentId,
    /// What to do.
    pub payload: TaskPayload,
    /// Higher runs first.
    pub priority: i32,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When an agent picked the task up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Task that delegated this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<Uuid>,
    /// Final result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Depth in the delegation tree (0 = root task).
    #[serde(default)]
    pub depth: u32,
    /// Set while a delegated task is persisted but not yet published.
    #[serde(default)]
    pub dispatch_pending: bool,
}

/// Queue payload announcing a task ready for pickup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDispatch {
    /// Task to run.
    pub task_id: Uuid,
    /// Agent that should run it.
    pub agent_role: AgentId,
}
