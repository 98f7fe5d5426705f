//! `tollgate.toml` loading.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tollgate_orchestrator::{default_profiles, AgentProfile, OrchestratorConfig};
use tollgate_worker::{DeadLetterConfig, RetryPolicy};
use tracing::info;

/// Top-level configuration file.
#[derive(Debug, Deserialize)]
pub struct TollgateConfig {
    /// Root of the file-backed document store and queue.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Orchestrator settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Worker runner settings.
    #[serde(default)]
    pub worker: WorkerSettings,
    /// Dead-letter alerting.
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    /// Sandbox interpreters.
    #[serde(default)]
    pub sandbox: SandboxSettings,
    /// Agent roster; the built-in roster when empty.
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
}

/// Settings shared by the task and dead-letter runners.
#[derive(Debug, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_dead_letter_topic")]
    pub dead_letter_topic: String,
    /// Consecutive sandbox failures before task pulling pauses.
    #[serde(default = "default_circuit_threshold")]
    pub circuit_threshold: u32,
    #[serde(default = "default_circuit_cool_down_secs")]
    pub circuit_cool_down_secs: i64,
    /// How often `serve` republishes stranded dispatches.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_max_retries(),
            dead_letter_topic: default_dead_letter_topic(),
            circuit_threshold: default_circuit_threshold(),
            circuit_cool_down_secs: default_circuit_cool_down_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl WorkerSettings {
    /// Retry policy with the configured retry count.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            ..RetryPolicy::default()
        }
    }
}

/// Interpreters used by the process sandbox.
#[derive(Debug, Deserialize)]
pub struct SandboxSettings {
    #[serde(default = "default_python")]
    pub python: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            python: default_python(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_max_concurrency() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_retries() -> u32 {
    3
}
fn default_dead_letter_topic() -> String {
    "dead-letters".to_string()
}
fn default_circuit_threshold() -> u32 {
    5
}
fn default_circuit_cool_down_secs() -> i64 {
    30
}
fn default_sweep_interval_secs() -> u64 {
    10
}
fn default_python() -> String {
    "python3".to_string()
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            orchestrator: OrchestratorConfig::default(),
            worker: WorkerSettings::default(),
            dead_letter: DeadLetterConfig::default(),
            sandbox: SandboxSettings::default(),
            agents: Vec::new(),
        }
    }
}

impl TollgateConfig {
    /// Parse a config document.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.orchestrator.validate()?;
        Ok(config)
    }

    /// Load `path`, falling back to defaults when the file does not exist.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::parse(&text)
                .with_context(|| format!("Failed to parse config file '{}'", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read config file '{}': {e}",
                path.display()
            )),
        }
    }

    /// The configured roster, or the built-in one.
    pub fn profiles(&self) -> Vec<AgentProfile> {
        if self.agents.is_empty() {
            default_profiles()
        } else {
            self.agents.clone()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = TollgateConfig::parse("").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.orchestrator.session_cap, 100.0);
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.dead_letter.alert_threshold, 5);
        assert_eq!(config.profiles().len(), default_profiles().len());
    }

    #[test]
    fn test_full_config() {
        let config = TollgateConfig::parse(
            r#"
            data_dir = "/var/lib/tollgate"

            [orchestrator]
            session_cap = 250.0
            escalation_threshold = 0.9

            [worker]
            max_retries = 5
            dead_letter_topic = "dlq"

            [dead_letter]
            alert_threshold = 10

            [[agents]]
            id = "triage"
            keywords = ["triage", "classify"]
            base_cost = 0.5
            language = "shell"
            "#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.session_cap, 250.0);
        assert_eq!(config.orchestrator.default_agent, "general");
        assert_eq!(config.worker.retry_policy().max_retries, 5);
        assert_eq!(config.worker.dead_letter_topic, "dlq");
        assert_eq!(config.dead_letter.window_minutes, 60);
        let profiles = config.profiles();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].sandbox_id(), "sandbox-triage");
    }

    #[test]
    fn test_invalid_orchestrator_settings_rejected() {
        assert!(TollgateConfig::parse("[orchestrator]\nsession_cap = 0.0\n").is_err());
    }

    #[tokio::test]
    async fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = TollgateConfig::load(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.worker.max_concurrency, 4);
    }
}
