use crate::types::{DelegationRequest, Task, TaskPayload, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// A delegation the spawner refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedDelegation {
    /// The refused request.
    pub request: DelegationRequest,
    /// Which limit it hit.
    pub reason: String,
}

/// Bounds on the delegation tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationLimits {
    /// Maximum depth of a delegated task (root = 0).
    pub max_depth: u32,
    /// Maximum direct children per task.
    pub max_fan_out: u32,
}

impl Default for DelegationLimits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_fan_out: 5,
        }
    }
}

/// Turns a finished task's delegation requests into child tasks, enforcing
/// depth and fan-out limits to prevent runaway recursion.
#[derive(Debug, Clone, Default)]
pub struct DelegationSpawner {
    limits: DelegationLimits,
}

impl DelegationSpawner {
    /// Create a spawner with the given limits.
    pub fn new(limits: DelegationLimits) -> Self {
        Self { limits }
    }

    /// The configured limits.
    pub fn limits(&self) -> DelegationLimits {
        self.limits
    }

    /// Split `requests` into those that may be spawned under `parent` and
    /// those that may not. `existing_children` counts children the parent
    /// already has.
    pub fn plan(
        &self,
        parent: &Task,
        existing_children: usize,
        requests: Vec<DelegationRequest>,
    ) -> (Vec<DelegationRequest>, Vec<RejectedDelegation>) {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        let child_depth = parent.depth + 1;

        for request in requests {
            let reason = if child_depth > self.limits.max_depth {
                Some(format!(
                    "maximum delegation depth {} exceeded (parent depth is {})",
                    self.limits.max_depth, parent.depth
                ))
            } else if existing_children + accepted.len() >= self.limits.max_fan_out as usize {
                Some(format!(
                    "task {} already has {} children (max {})",
                    parent.id,
                    existing_children + accepted.len(),
                    self.limits.max_fan_out
                ))
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    warn!(
                        parent_task_id = %parent.id,
                        target_role = %request.target_role,
                        %reason,
                        "Delegation rejected"
                    );
                    rejected.push(RejectedDelegation { request, reason });
                }
                None => accepted.push(request),
            }
        }
        (accepted, rejected)
    }

    /// Id of the `index`-th child spawned by `parent_id`'s completion. Stable,
    /// so an interrupted completion rebuilds the same children.
    pub fn child_id(parent_id: Uuid, index: usize) -> Uuid {
        Uuid::new_v5(&parent_id, format!("delegation-{index}").as_bytes())
    }

    /// Build the `index`-th pending child task for an accepted request. The
    /// child is flagged `dispatch_pending` until it has been published.
    pub fn build_child(
        &self,
        parent: &Task,
        index: usize,
        request: DelegationRequest,
        default_priority: Option<i32>,
        now: DateTime<Utc>,
    ) -> Task {
        let (content, context, parameters) = match request.payload {
            serde_json::Value::String(s) => (s, serde_json::Value::Null, serde_json::Value::Null),
            serde_json::Value::Object(mut map) => {
                let content = match map.remove("content") {
                    Some(serde_json::Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                let context = map.remove("context").unwrap_or_default();
                let parameters = match map.remove("parameters") {
                    Some(p) => p,
                    None if map.is_empty() => serde_json::Value::Null,
                    None => serde_json::Value::Object(map),
                };
                (content, context, parameters)
            }
            serde_json::Value::Null => (String::new(), serde_json::Value::Null, serde_json::Value::Null),
            other => (other.to_string(), serde_json::Value::Null, serde_json::Value::Null),
        };

        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert(
            "delegated_from".to_string(),
            serde_json::Value::String(parent.agent_role.clone()),
        );
        metadata.insert(
            "wait_for_result".to_string(),
            serde_json::Value::Bool(request.wait_for_result),
        );

        Task {
            id: Self::child_id(parent.id, index),
            session_id: parent.session_id.clone(),
            conversation_id: parent.conversation_id.clone(),
            agent_role: request.target_role,
            payload: TaskPayload {
                intent: request.intent,
                content,
                attachments: Vec::new(),
                context,
                parameters,
            },
            priority: request
                .priority
                .or(default_priority)
                .unwrap_or(parent.priority),
            status: TaskStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            parent_task_id: Some(parent.id),
            result: None,
            metadata,
            depth: parent.depth + 1,
            dispatch_pending: true,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parent(depth: u32) -> Task {
        Task {
            id: Uuid::new_v4(),
            session_id: "s1".into(),
            conversation_id: "c1".into(),
            agent_role: "research".into(),
            payload: TaskPayload::new("research", "find sources"),
            priority: 6,
            status: TaskStatus::Completed,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            parent_task_id: None,
            result: None,
            metadata: Default::default(),
            depth,
            dispatch_pending: false,
        }
    }

    fn request(role: &str) -> DelegationRequest {
        DelegationRequest {
            target_role: role.into(),
            intent: "follow_up".into(),
            payload: json!("summarize the findings"),
            priority: None,
            wait_for_result: false,
        }
    }

    #[test]
    fn test_fan_out_limit() {
        let spawner = DelegationSpawner::new(DelegationLimits {
            max_depth: 3,
            max_fan_out: 2,
        });
        let (ok, rejected) = spawner.plan(
            &parent(0),
            1,
            vec![request("code"), request("data"), request("content")],
        );
        assert_eq!(ok.len(), 1);
        assert_eq!(rejected.len(), 2);
        assert!(rejected[0].reason.contains("max 2"));
    }

    #[test]
    fn test_depth_limit() {
        let spawner = DelegationSpawner::default();
        let (ok, rejected) = spawner.plan(&parent(3), 0, vec![request("code")]);
        assert!(ok.is_empty());
        assert!(rejected[0].reason.contains("depth"));

        let (ok, _) = spawner.plan(&parent(2), 0, vec![request("code")]);
        assert_eq!(ok.len(), 1);
    }

    #[test]
    fn test_build_child_links_parent() {
        let p = parent(1);
        let child =
            DelegationSpawner::default().build_child(&p, 0, request("code"), Some(7), Utc::now());
        assert_eq!(child.id, DelegationSpawner::child_id(p.id, 0));
        assert_ne!(child.id, DelegationSpawner::child_id(p.id, 1));
        assert_eq!(child.parent_task_id, Some(p.id));
        assert_eq!(child.depth, 2);
        assert_eq!(child.priority, 7);
        assert_eq!(child.payload.content, "summarize the findings");
        assert_eq!(child.metadata["delegated_from"], json!("research"));
        assert!(child.dispatch_pending);
        assert_eq!(child.status, TaskStatus::Pending);
    }

    #[test]
    fn test_build_child_object_payload() {
        let mut req = request("data");
        req.payload = json!({"content": "plot it", "context": {"rows": 10}, "format": "png"});
        req.priority = Some(9);
        let child = DelegationSpawner::default().build_child(&parent(0), 0, req, Some(2), Utc::now());
        assert_eq!(child.payload.content, "plot it");
        assert_eq!(child.payload.context, json!({"rows": 10}));
        assert_eq!(child.payload.parameters, json!({"format": "png"}));
        assert_eq!(child.priority, 9);
    }
}
