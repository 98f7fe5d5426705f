use crate::spawner::DelegationLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tollgate_core::{TollgateError, TollgateResult};

/// Orchestrator settings (the `[orchestrator]` table of `tollgate.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Per-session spending cap `C`.
    #[serde(default = "default_session_cap")]
    pub session_cap: f64,
    /// Usage ratio above which runs are escalated.
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,
    /// Hard limit on one sandbox execution.
    #[serde(default = "default_sandbox_timeout_secs")]
    pub sandbox_timeout_secs: u64,
    /// Cost of the fallback delegation.
    #[serde(default = "default_base_cost")]
    pub base_cost: f64,
    /// Agent used when the router finds no match.
    #[serde(default = "default_agent")]
    pub default_agent: String,
    /// Completed task outputs pulled into a run's context.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Topic delegated tasks are published on.
    #[serde(default = "default_task_topic")]
    pub task_topic: String,
    /// Maximum delegation depth.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Maximum children per task.
    #[serde(default = "default_max_fan_out")]
    pub max_fan_out: u32,
    /// Allocation for ledger accounts opened on first use.
    #[serde(default = "default_initial_budget")]
    pub default_initial_budget: f64,
}

fn default_session_cap() -> f64 {
    100.0
}

fn default_escalation_threshold() -> f64 {
    0.8
}

fn default_sandbox_timeout_secs() -> u64 {
    30
}

fn default_base_cost() -> f64 {
    1.0
}

fn default_agent() -> String {
    "general".to_string()
}

fn default_context_window() -> usize {
    5
}

fn default_task_topic() -> String {
    "agent-tasks".to_string()
}

fn default_max_depth() -> u32 {
    3
}

fn default_max_fan_out() -> u32 {
    5
}

fn default_initial_budget() -> f64 {
    100.0
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session_cap: default_session_cap(),
            escalation_threshold: default_escalation_threshold(),
            sandbox_timeout_secs: default_sandbox_timeout_secs(),
            base_cost: default_base_cost(),
            default_agent: default_agent(),
            context_window: default_context_window(),
            task_topic: default_task_topic(),
            max_depth: default_max_depth(),
            max_fan_out: default_max_fan_out(),
            default_initial_budget: default_initial_budget(),
        }
    }
}

impl OrchestratorConfig {
    /// Sandbox timeout as a [`Duration`].
    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_timeout_secs)
    }

    /// Delegation tree limits.
    pub fn limits(&self) -> DelegationLimits {
        DelegationLimits {
            max_depth: self.max_depth,
            max_fan_out: self.max_fan_out,
        }
    }

    /// Reject settings the orchestrator cannot work with.
    pub fn validate(&self) -> TollgateResult<()> {
        if !(self.session_cap.is_finite() && self.session_cap > 0.0) {
            return Err(TollgateError::Config(format!(
                "session_cap must be positive, got {}",
                self.session_cap
            )));
        }
        if !(self.escalation_threshold.is_finite() && self.escalation_threshold > 0.0) {
            return Err(TollgateError::Config(format!(
                "escalation_threshold must be positive, got {}",
                self.escalation_threshold
            )));
        }
        if self.sandbox_timeout_secs == 0 {
            return Err(TollgateError::Config(
                "sandbox_timeout_secs must be at least 1".to_string(),
            ));
        }
        if !(self.base_cost.is_finite() && self.base_cost >= 0.0) {
            return Err(TollgateError::Config(format!(
                "base_cost must be non-negative, got {}",
                self.base_cost
            )));
        }
        if self.default_agent.trim().is_empty() || self.task_topic.trim().is_empty() {
            return Err(TollgateError::Config(
                "default_agent and task_topic must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.session_cap, 100.0);
        assert_eq!(config.escalation_threshold, 0.8);
        assert_eq!(config.limits(), DelegationLimits::default());
    }

    #[test]
    fn test_rejects_zero_cap() {
        let config = OrchestratorConfig {
            session_cap: 0.0,
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
