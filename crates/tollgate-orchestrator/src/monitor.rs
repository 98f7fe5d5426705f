use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// What an agent is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// No delegation running.
    Idle,
    /// At least one delegation running.
    Working,
    /// The last delegation failed.
    Error,
}

/// Running totals for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Delegations executed.
    pub delegations: u64,
    /// Failed delegations.
    pub errors: u64,
    /// Total sandbox latency.
    pub duration_ms: u64,
    /// Total cost debited.
    pub cost: f64,
}

/// Snapshot of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Agent id.
    pub agent_id: String,
    /// Current status.
    pub status: AgentStatus,
    /// Delegations in flight.
    pub in_flight: u32,
    /// Running totals.
    pub metrics: AgentMetrics,
}

impl AgentState {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            status: AgentStatus::Idle,
            in_flight: 0,
            metrics: AgentMetrics::default(),
        }
    }
}

/// Process-local per-agent counters for operators. Never authoritative;
/// the ledger holds the real spend.
pub struct AgentMonitor {
    states: RwLock<HashMap<String, AgentState>>,
}

impl AgentMonitor {
    /// An empty monitor; agents appear on first use.
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// A delegation to `agent_id` started.
    pub async fn start(&self, agent_id: &str) {
        let mut states = self.states.write().await;
        let state = states
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentState::new(agent_id));
        state.in_flight += 1;
        state.status = AgentStatus::Working;
    }

    /// A delegation to `agent_id` finished.
    pub async fn finish(&self, agent_id: &str, success: bool, duration_ms: u64, cost: f64) {
        let mut states = self.states.write().await;
        let state = states
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentState::new(agent_id));
        state.in_flight = state.in_flight.saturating_sub(1);
        state.metrics.delegations += 1;
        state.metrics.duration_ms += duration_ms;
        state.metrics.cost += cost;
        if success {
            if state.in_flight == 0 {
                state.status = AgentStatus::Idle;
            }
        } else {
            state.metrics.errors += 1;
            state.status = AgentStatus::Error;
        }
    }

    /// State of one agent.
    pub async fn get_state(&self, agent_id: &str) -> Option<AgentState> {
        self.states.read().await.get(agent_id).cloned()
    }

    /// All agents, by id.
    pub async fn snapshot(&self) -> Vec<AgentState> {
        let mut states: Vec<_> = self.states.read().await.values().cloned().collect();
        states.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        states
    }

    /// Totals across all agents.
    pub async fn aggregate_metrics(&self) -> AgentMetrics {
        let states = self.states.read().await;
        let mut total = AgentMetrics::default();
        for state in states.values() {
            total.delegations += state.metrics.delegations;
            total.errors += state.metrics.errors;
            total.duration_ms += state.metrics.duration_ms;
            total.cost += state.metrics.cost;
        }
        total
    }

    /// Snapshot as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "agents": self.snapshot().await,
            "aggregate": self.aggregate_metrics().await,
        })
    }
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}
