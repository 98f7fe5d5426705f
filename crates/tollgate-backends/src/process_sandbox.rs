use async_trait::async_trait;
use std::process::Stdio;
use std::time::Instant;
use tollgate_core::{Sandbox, SandboxOutcome, SandboxRequest, TollgateError, TollgateResult};
use tracing::{info, warn};

const MAX_STDOUT: usize = 50_000;
const MAX_STDERR: usize = 10_000;

/// Runs sandbox requests as local subprocesses.
///
/// Isolation is limited to a cleared environment and a hard timeout; use a
/// container-backed [`Sandbox`] for untrusted code in production.
pub struct ProcessSandbox {
    python: String,
    shell: String,
    node: String,
}

impl ProcessSandbox {
    /// Create a sandbox using `python3`, `sh` and `node` from `PATH`.
    pub fn new() -> Self {
        Self {
            python: "python3".into(),
            shell: "sh".into(),
            node: "node".into(),
        }
    }

    /// Override the Python interpreter.
    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    fn interpreter(&self, language: &str) -> Option<(&str, &'static str)> {
        match language {
            "python" | "py" => Some((self.python.as_str(), "-c")),
            "shell" | "sh" | "bash" => Some((self.shell.as_str(), "-c")),
            "javascript" | "js" | "node" => Some((self.node.as_str(), "-e")),
            _ => None,
        }
    }
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn execute(&self, request: SandboxRequest) -> TollgateResult<SandboxOutcome> {
        let (program, flag) = self.interpreter(&request.language).ok_or_else(|| {
            TollgateError::Validation(format!("unsupported language: {}", request.language))
        })?;

        info!(
            sandbox_id = %request.sandbox_id,
            language = %request.language,
            timeout_ms = request.timeout.as_millis() as u64,
            "Executing sandboxed code"
        );

        let mut command = tokio::process::Command::new(program);
        command
            .arg(flag)
            .arg(&request.code)
            .env_clear()
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }

        let start = Instant::now();
        let child = command
            .spawn()
            .map_err(|e| TollgateError::Sandbox(format!("failed to start {program}: {e}")))?;

        match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let elapsed = start.elapsed().as_millis() as u64;
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if output.status.success() {
                    Ok(SandboxOutcome::success(
                        truncate_output(&stdout, MAX_STDOUT),
                        elapsed,
                    ))
                } else {
                    let code = output.status.code().unwrap_or(-1);
                    Ok(SandboxOutcome {
                        success: false,
                        output: truncate_output(&stdout, MAX_STDOUT),
                        error: Some(format!(
                            "exit code {code}: {}",
                            truncate_output(&stderr, MAX_STDERR)
                        )),
                        execution_time_ms: elapsed,
                    })
                }
            }
            Ok(Err(e)) => Err(TollgateError::Sandbox(format!("failed to collect output: {e}"))),
            Err(_) => {
                warn!(sandbox_id = %request.sandbox_id, "Sandbox execution timed out");
                Ok(SandboxOutcome::failure(
                    format!("timed out after {}ms", request.timeout.as_millis()),
                    start.elapsed().as_millis() as u64,
                ))
            }
        }
    }
}

fn truncate_output(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated, {} total bytes]", &s[..end], s.len())
}
