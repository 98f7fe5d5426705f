use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tollgate_core::Clock;
use tracing::{info, warn};

/// State of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Jobs flow; counts consecutive failures.
    Closed {
        /// Failures since the last success.
        consecutive_failures: u32,
    },
    /// Pulling is suspended until the cool-down ends.
    Open {
        /// End of the cool-down.
        until: DateTime<Utc>,
    },
    /// Cool-down elapsed; the next outcome decides.
    HalfOpen,
}

/// Process-local circuit breakers keyed by circuit id.
///
/// Advisory state only: a restart closes every circuit.
pub struct CircuitBreakers {
    failure_threshold: u32,
    cool_down: Duration,
    clock: Arc<dyn Clock>,
    circuits: Mutex<HashMap<String, CircuitState>>,
}

impl CircuitBreakers {
    /// Open a circuit after `failure_threshold` consecutive failures and keep
    /// it open for `cool_down`.
    pub fn new(failure_threshold: u32, cool_down: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cool_down,
            clock,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Whether work may be pulled for `circuit_id`. Moves an expired open
    /// circuit to half-open.
    pub fn allow(&self, circuit_id: &str) -> bool {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock();
        let state = circuits
            .entry(circuit_id.to_string())
            .or_insert(CircuitState::Closed {
                consecutive_failures: 0,
            });
        match *state {
            CircuitState::Open { until } if now >= until => {
                info!(circuit_id, "Circuit half-open");
                *state = CircuitState::HalfOpen;
                true
            }
            CircuitState::Open { .. } => false,
            _ => true,
        }
    }

    /// Record a successful job.
    pub fn record_success(&self, circuit_id: &str) {
        let mut circuits = self.circuits.lock();
        let previous = circuits.insert(
            circuit_id.to_string(),
            CircuitState::Closed {
                consecutive_failures: 0,
            },
        );
        if matches!(previous, Some(CircuitState::HalfOpen)) {
            info!(circuit_id, "Circuit closed");
        }
    }

    /// Record a failed job.
    pub fn record_failure(&self, circuit_id: &str) {
        let until = self.clock.now() + self.cool_down;
        let mut circuits = self.circuits.lock();
        let state = circuits
            .entry(circuit_id.to_string())
            .or_insert(CircuitState::Closed {
                consecutive_failures: 0,
            });
        let next = match *state {
            CircuitState::Closed {
                consecutive_failures,
            } if consecutive_failures + 1 >= self.failure_threshold => {
                CircuitState::Open { until }
            }
            CircuitState::Closed {
                consecutive_failures,
            } => CircuitState::Closed {
                consecutive_failures: consecutive_failures + 1,
            },
            CircuitState::HalfOpen => CircuitState::Open { until },
            open @ CircuitState::Open { .. } => open,
        };
        if matches!(next, CircuitState::Open { .. }) && !matches!(*state, CircuitState::Open { .. })
        {
            warn!(circuit_id, until = %until, "Circuit opened");
        }
        *state = next;
    }

    /// Current state of a circuit; unknown circuits are closed.
    pub fn state(&self, circuit_id: &str) -> CircuitState {
        self.circuits
            .lock()
            .get(circuit_id)
            .copied()
            .unwrap_or(CircuitState::Closed {
                consecutive_failures: 0,
            })
    }
}
