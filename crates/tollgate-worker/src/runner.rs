use crate::circuit::CircuitBreakers;
use crate::job::{DeadLetterEnvelope, FailureContext, JobEnvelope, JobMessage};
use crate::retry::RetryPolicy;
use crate::worker::{Worker, WorkerConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tollgate_core::{Clock, MessageQueue, QueueMessage, TollgateError, TollgateResult};
use tracing::{error, info, warn};
use uuid::Uuid;

/// What happened to one pulled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    /// Processed successfully.
    Completed,
    /// Failed and published back to its topic.
    Retried {
        /// Failures so far.
        failure_count: u32,
    },
    /// Failed for good and published to the dead-letter topic.
    DeadLettered {
        /// Failures in total.
        failure_count: u32,
    },
}

/// Summary of one [`WorkerRunner::poll_once`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Messages pulled from the topic.
    pub pulled: usize,
    /// Jobs that succeeded.
    pub completed: usize,
    /// Jobs requeued.
    pub retried: usize,
    /// Jobs dead-lettered.
    pub dead_lettered: usize,
    /// Jobs whose failure could not be republished.
    pub lost: usize,
    /// Nothing was pulled because the circuit is open.
    pub circuit_open: bool,
}

impl PollReport {
    fn record(&mut self, result: Result<TollgateResult<JobDisposition>, JoinError>) {
        match result {
            Ok(Ok(JobDisposition::Completed)) => self.completed += 1,
            Ok(Ok(JobDisposition::Retried { .. })) => self.retried += 1,
            Ok(Ok(JobDisposition::DeadLettered { .. })) => self.dead_lettered += 1,
            Ok(Err(_)) | Err(_) => self.lost += 1,
        }
    }
}

/// Drives a [`Worker`]: pulls its topic, bounds concurrency, and routes
/// failures to a retry or the dead-letter topic.
///
/// Every job runs in its own task, and `process` runs in a nested task so a
/// panic is contained to that job.
pub struct WorkerRunner<W: Worker> {
    worker: Arc<W>,
    config: Arc<WorkerConfig>,
    queue: Arc<dyn MessageQueue>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    circuits: Option<Arc<CircuitBreakers>>,
    semaphore: Arc<Semaphore>,
}

impl<W: Worker> Clone for WorkerRunner<W> {
    fn clone(&self) -> Self {
        Self {
            worker: Arc::clone(&self.worker),
            config: Arc::clone(&self.config),
            queue: Arc::clone(&self.queue),
            clock: Arc::clone(&self.clock),
            retry: self.retry.clone(),
            circuits: self.circuits.clone(),
            semaphore: Arc::clone(&self.semaphore),
        }
    }
}

impl<W: Worker> WorkerRunner<W> {
    /// Create a runner with the default [`RetryPolicy`] and no circuit breaker.
    pub fn new(
        worker: Arc<W>,
        config: WorkerConfig,
        queue: Arc<dyn MessageQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            worker,
            config: Arc::new(config),
            queue,
            clock,
            retry: RetryPolicy::default(),
            circuits: None,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Consult `circuits` when `config.circuit_id` is set.
    pub fn with_circuit_breakers(mut self, circuits: Arc<CircuitBreakers>) -> Self {
        self.circuits = Some(circuits);
        self
    }

    /// The runner's configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn circuit(&self) -> Option<(&CircuitBreakers, &str)> {
        match (&self.circuits, &self.config.circuit_id) {
            (Some(circuits), Some(id)) => Some((circuits.as_ref(), id.as_str())),
            _ => None,
        }
    }

    /// Pull as many messages as there are free slots. `None` when the circuit
    /// is open.
    async fn pull_batch(&self) -> TollgateResult<Option<Vec<QueueMessage>>> {
        if let Some((circuits, id)) = self.circuit() {
            if !circuits.allow(id) {
                return Ok(None);
            }
        }
        let free = self.semaphore.available_permits();
        if free == 0 {
            return Ok(Some(Vec::new()));
        }
        self.queue.pull(&self.config.topic, free).await.map(Some)
    }

    fn spawn_job(
        &self,
        jobs: &mut JoinSet<TollgateResult<JobDisposition>>,
        message: QueueMessage,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let runner = self.clone();
        jobs.spawn(async move {
            let _permit = permit;
            runner.handle(message).await
        });
    }

    async fn acquire(&self) -> TollgateResult<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| TollgateError::Worker(format!("concurrency limiter closed: {e}")))
    }

    /// Pull one batch, process it, and wait for every job in it to settle.
    pub async fn poll_once(&self) -> TollgateResult<PollReport> {
        let mut report = PollReport::default();
        let Some(messages) = self.pull_batch().await? else {
            report.circuit_open = true;
            return Ok(report);
        };
        report.pulled = messages.len();

        let mut jobs = JoinSet::new();
        for message in messages {
            let permit = self.acquire().await?;
            self.spawn_job(&mut jobs, message, permit);
        }
        while let Some(result) = jobs.join_next().await {
            report.record(result);
        }
        Ok(report)
    }

    /// Run the poll loop in the background until the handle is shut down or
    /// dropped. In-flight jobs are awaited before the loop exits.
    pub fn start(self) -> WorkerHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let join = tokio::spawn(async move {
            let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
            info!(
                worker = self.worker.name(),
                topic = %self.config.topic,
                max_concurrency = self.config.max_concurrency,
                "Worker started"
            );

            let mut jobs = JoinSet::new();
            loop {
                if *stop.borrow() {
                    break;
                }
                while jobs.try_join_next().is_some() {}

                let messages = match self.pull_batch().await {
                    Ok(Some(messages)) => messages,
                    Ok(None) => Vec::new(),
                    Err(e) => {
                        warn!(worker = self.worker.name(), error = %e, "Pull failed");
                        Vec::new()
                    }
                };

                if messages.is_empty() {
                    tokio::select! {
                        changed = stop.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                    continue;
                }

                for message in messages {
                    match self.acquire().await {
                        Ok(permit) => self.spawn_job(&mut jobs, message, permit),
                        Err(e) => error!(worker = self.worker.name(), error = %e, "Dropping job"),
                    }
                }
                if self.semaphore.available_permits() == 0 {
                    jobs.join_next().await;
                }
            }

            while jobs.join_next().await.is_some() {}
            info!(worker = self.worker.name(), "Worker stopped");
        });
        WorkerHandle { shutdown, join }
    }

    async fn handle(&self, message: QueueMessage) -> TollgateResult<JobDisposition> {
        let failure = FailureContext::from_attributes(&message.attributes);

        let job = match JobMessage::from_queue(&message) {
            Ok(job) => job,
            Err(e) => {
                return self
                    .fail(&message.topic, message.payload, failure, e.to_string(), false, None)
                    .await
            }
        };
        let payload: W::Payload = match serde_json::from_value(job.envelope.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                return self
                    .fail(
                        &message.topic,
                        message.payload,
                        failure,
                        format!("invalid payload: {e}"),
                        false,
                        None,
                    )
                    .await
            }
        };

        let started = Instant::now();
        let worker = Arc::clone(&self.worker);
        let job_for_worker = job.clone();
        let joined =
            tokio::spawn(async move { worker.process(payload, &job_for_worker).await }).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match joined {
            Ok(Ok(outcome)) if outcome.success => {
                if let Some((circuits, id)) = self.circuit() {
                    circuits.record_success(id);
                }
                info!(
                    worker = self.worker.name(),
                    job_id = %job.envelope.job_id,
                    duration_ms,
                    "Job completed"
                );
                Ok(JobDisposition::Completed)
            }
            Ok(Ok(outcome)) => {
                let error = outcome
                    .error
                    .unwrap_or_else(|| "worker reported failure".to_string());
                self.fail(&message.topic, message.payload, failure, error, outcome.retryable, None)
                    .await
            }
            Ok(Err(e)) => {
                let retryable = e.is_retryable();
                self.fail(&message.topic, message.payload, failure, e.to_string(), retryable, None)
                    .await
            }
            Err(join_error) => {
                let detail = panic_detail(join_error);
                error!(
                    worker = self.worker.name(),
                    job_id = %job.envelope.job_id,
                    panic = %detail,
                    "Worker panicked"
                );
                self.fail(
                    &message.topic,
                    message.payload,
                    failure,
                    format!("worker panicked: {detail}"),
                    true,
                    Some(detail),
                )
                .await
            }
        }
    }

    async fn fail(
        &self,
        topic: &str,
        raw: serde_json::Value,
        mut failure: FailureContext,
        error: String,
        retryable: bool,
        error_stack: Option<String>,
    ) -> TollgateResult<JobDisposition> {
        let now = self.clock.now();
        failure.record(error.clone(), now);
        let failure_count = failure.failure_count;

        if retryable {
            if let Some((circuits, id)) = self.circuit() {
                circuits.record_failure(id);
            }
        }

        if self.retry.should_retry(failure_count, retryable) {
            warn!(
                worker = self.worker.name(),
                topic,
                failure_count,
                error = %error,
                "Job failed, requeueing"
            );
            let delay = self.retry.backoff_ms(failure_count);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.queue
                .publish(topic, raw, failure.to_attributes())
                .await
                .inspect_err(|e| error!(topic, error = %e, "Requeue failed, job lost"))?;
            return Ok(JobDisposition::Retried { failure_count });
        }

        error!(
            worker = self.worker.name(),
            topic,
            failure_count,
            retryable,
            error = %error,
            "Job dead-lettered"
        );
        let correlation_id = raw
            .get("correlation_id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        let dead_letter = DeadLetterEnvelope {
            id: Uuid::new_v4(),
            original_topic: topic.to_string(),
            job: raw,
            failure,
            error_stack,
            dead_lettered_at: now,
        };
        let mut envelope = JobEnvelope::new(
            format!("worker:{}", self.worker.name()),
            serde_json::to_value(&dead_letter)?,
        )
        .with_job_id(dead_letter.id.to_string());
        if let Some(correlation_id) = correlation_id {
            envelope = envelope.with_correlation_id(correlation_id);
        }
        self.queue
            .publish(
                &self.config.dead_letter_topic,
                serde_json::to_value(&envelope)?,
                HashMap::new(),
            )
            .await
            .inspect_err(|e| error!(topic, error = %e, "Dead-letter publish failed, job lost"))?;
        Ok(JobDisposition::DeadLettered { failure_count })
    }
}

fn panic_detail(err: JoinError) -> String {
    if !err.is_panic() {
        return "task cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to a running poll loop.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop polling, wait for in-flight jobs, and return.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "Worker loop ended abnormally");
        }
    }
}
