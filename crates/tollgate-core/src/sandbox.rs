use crate::error::TollgateResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A request to run code inside a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    /// Sandbox bound to the executing agent.
    pub sandbox_id: String,
    /// Source code to execute.
    pub code: String,
    /// Language of `code` (`python`, `shell`, `javascript`).
    pub language: String,
    /// Wall-clock limit for the execution.
    pub timeout: Duration,
    /// Environment variables exposed to the code.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// The result of a sandboxed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxOutcome {
    /// Whether the code ran to a successful exit.
    pub success: bool,
    /// Captured standard output.
    pub output: String,
    /// Error text when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Time spent executing.
    pub execution_time_ms: u64,
}

impl SandboxOutcome {
    /// A successful outcome.
    pub fn success(output: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            execution_time_ms,
        }
    }

    /// A failed outcome.
    pub fn failure(error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            execution_time_ms,
        }
    }
}

/// Isolated execution environment for agent-generated code.
///
/// An `Err` means the sandbox service itself failed; code that ran and failed
/// is reported as `Ok` with `success == false`.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Execute a request.
    async fn execute(&self, request: SandboxRequest) -> TollgateResult<SandboxOutcome>;
}
