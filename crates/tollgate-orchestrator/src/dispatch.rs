use crate::engine::{DelegationExecution, OrchestrationOutcome, Orchestrator};
use crate::types::{DelegationRequest, TaskDispatch, TaskResult, TaskStatus};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tollgate_core::TollgateResult;
use tollgate_worker::{JobMessage, ProcessOutcome, RetryPolicy, Worker};
use tracing::{info, warn};
use uuid::Uuid;

/// Consumes the task topic: starts each dispatched task, runs it through the
/// orchestrator, and completes it so its delegations fan out.
///
/// A run that failed only because the sandbox was unreachable or timed out
/// leaves the task in progress and asks for a retry. Redeliveries carrying a
/// failure count pick an in-progress task back up, either finishing a
/// completion that was interrupted after the run or running it again. On the
/// last attempt allowed by the retry policy the task is failed for good.
pub struct TaskDispatchWorker {
    orchestrator: Arc<Orchestrator>,
    retry: RetryPolicy,
}

impl TaskDispatchWorker {
    /// Create a worker driving `orchestrator`.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            retry: RetryPolicy::default(),
        }
    }

    /// Use the retry policy of the runner this worker is attached to.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Whether a failure on this delivery exhausts the job's retries.
    fn last_attempt(&self, job: &JobMessage) -> bool {
        !self
            .retry
            .should_retry(job.failure.failure_count.saturating_add(1), true)
    }

    /// Complete the task with `result` and report how the job went.
    async fn finish(
        &self,
        task_id: Uuid,
        result: TaskResult,
        started: Instant,
    ) -> TollgateResult<ProcessOutcome> {
        let escalated = result
            .output
            .get("escalation_id")
            .is_some_and(|id| !id.is_null());
        let transient = result
            .output
            .get("transient")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let run_id = result.output.get("run_id").cloned();
        let success = result.success;
        let error = result
            .error
            .clone()
            .unwrap_or_else(|| "task failed".to_string());

        let completion = self
            .orchestrator
            .tasks()
            .complete_task(task_id, result)
            .await?;
        let children = completion.map_or(0, |c| c.children.len());
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = if success || escalated {
            ProcessOutcome::success(serde_json::json!({
                "task_id": task_id,
                "run_id": run_id,
                "escalated": escalated,
                "children": children,
            }))
        } else if transient {
            ProcessOutcome::failure(error)
        } else {
            ProcessOutcome::permanent_failure(error)
        };
        Ok(outcome.with_duration_ms(duration_ms))
    }
}

/// Delegation requests announced by successful sandbox runs. An agent asks
/// for sub-tasks by printing a JSON object with a `delegate_to` array.
fn announced_delegations(executions: &[DelegationExecution]) -> Vec<DelegationRequest> {
    executions
        .iter()
        .filter(|e| e.success)
        .filter_map(|e| serde_json::from_str::<serde_json::Value>(e.output.trim()).ok())
        .filter_map(|mut v| v.get_mut("delegate_to").map(serde_json::Value::take))
        .filter_map(|v| serde_json::from_value::<Vec<DelegationRequest>>(v).ok())
        .flatten()
        .collect()
}

fn run_result(outcome: &OrchestrationOutcome) -> TaskResult {
    let output = serde_json::json!({
        "run_id": outcome.run_id,
        "output": outcome.output,
        "escalation_id": outcome.escalation_id,
        "transient": outcome.failed_transiently(),
        "executions": outcome.executions,
    });
    // An escalated task fails here; the approved escalation is resumed
    // on its own, outside the task tree.
    if outcome.success {
        TaskResult::success(output).with_delegations(announced_delegations(&outcome.executions))
    } else {
        TaskResult {
            success: false,
            output,
            error: Some(outcome.message.clone()),
            delegate_to: Vec::new(),
        }
    }
}

#[async_trait]
impl Worker for TaskDispatchWorker {
    type Payload = TaskDispatch;

    fn name(&self) -> &str {
        "task-dispatch"
    }

    async fn process(&self, payload: TaskDispatch, job: &JobMessage) -> TollgateResult<ProcessOutcome> {
        let started = Instant::now();
        let tasks = self.orchestrator.tasks();
        let failure_count = job.failure.failure_count;

        let Some(task) = tasks.get_task(payload.task_id).await? else {
            return Ok(ProcessOutcome::permanent_failure(format!(
                "task {} not found",
                payload.task_id
            )));
        };
        let task = match task.status {
            TaskStatus::Pending => match tasks.start_task(task.id).await? {
                Some(task) => task,
                None => {
                    return Ok(ProcessOutcome::permanent_failure(format!(
                        "task {} disappeared",
                        payload.task_id
                    )))
                }
            },
            TaskStatus::InProgress if failure_count > 0 => {
                if let Some(result) = task.result.clone() {
                    info!(task_id = %task.id, failure_count, "Finishing interrupted completion");
                    return self.finish(task.id, result, started).await;
                }
                info!(task_id = %task.id, failure_count, "Retrying in-progress task");
                task
            }
            status => {
                // Redelivery of a task that already ran, or is running.
                info!(
                    task_id = %task.id,
                    %status,
                    message_id = %job.message_id,
                    "Skipping task that is no longer pending"
                );
                return Ok(ProcessOutcome::success(serde_json::json!({
                    "task_id": task.id,
                    "skipped": true,
                })));
            }
        };

        let outcome = match self.orchestrator.run_task(&task).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_retryable() && !self.last_attempt(job) => {
                warn!(task_id = %task.id, failure_count, error = %e, "Task run failed, retrying");
                return Err(e);
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Task run failed");
                tasks
                    .complete_task(task.id, TaskResult::failure(e.to_string()))
                    .await?;
                return Ok(if e.is_retryable() {
                    ProcessOutcome::failure(e.to_string())
                } else {
                    ProcessOutcome::permanent_failure(e.to_string())
                });
            }
        };

        if outcome.failed_transiently() && !self.last_attempt(job) {
            warn!(
                task_id = %task.id,
                run_id = %outcome.run_id,
                failure_count,
                message = %outcome.message,
                "Sandbox unavailable, retrying task"
            );
            return Ok(ProcessOutcome::failure(outcome.message)
                .with_duration_ms(started.elapsed().as_millis() as u64));
        }

        let result = run_result(&outcome);
        tasks.record_result(task.id, &result).await?;
        self.finish(task.id, result, started).await
    }
}
