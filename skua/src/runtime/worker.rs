use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::events::{InProcEventBus, JobEvent, JobEventPayload};
use crate::job::{DequeueRequest, Job, JobStatus};
use crate::queue::QueueStore;
use crate::retry::FailOutcome;
use crate::telemetry;

use super::handler::{HandlerError, HandlerRegistry};
use super::supervisor::ShutdownToken;

/// Configuration for individual workers in the runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identity recorded in `claimed_by`.
    pub worker_id: String,
    /// Sleep between polls when no job is eligible, in milliseconds.
    pub poll_interval_ms: u64,
    /// Sleep after a failed claim, in milliseconds. Also the first delay
    /// between report retries.
    pub error_backoff_ms: u64,
    /// Extra attempts made to write an outcome back before giving up.
    pub report_retries: u32,
    /// Job types to claim. `None` claims every type with a registered handler.
    pub job_types: Option<Vec<String>>,
}

impl WorkerConfig {
    /// Create a new worker configuration with the given worker ID.
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the backoff after storage errors.
    pub fn with_error_backoff(mut self, ms: u64) -> Self {
        self.error_backoff_ms = ms;
        self
    }

    pub fn with_report_retries(mut self, retries: u32) -> Self {
        self.report_retries = retries;
        self
    }

    /// Restrict claims to the given job types.
    pub fn with_job_types<I, S>(mut self, job_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.job_types = Some(job_types.into_iter().map(Into::into).collect());
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            poll_interval_ms: 500,
            error_backoff_ms: 1000,
            report_retries: 3,
            job_types: None,
        }
    }
}

/// Counters kept by one worker over its lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    /// Outcomes discarded because the stale-claim sweep had taken the job back.
    pub lost: u64,
}

impl std::ops::AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.retried += other.retried;
        self.failed += other.failed;
        self.lost += other.lost;
    }
}

/// Polling worker: claims one job at a time, runs its handler and reports
/// the outcome.
pub struct Worker<Q>
where
    Q: QueueStore + ?Sized + 'static,
{
    config: WorkerConfig,
    queue: Arc<Q>,
    handlers: Arc<HandlerRegistry>,
    events: Option<InProcEventBus>,
}

impl<Q> std::fmt::Debug for Worker<Q>
where
    Q: QueueStore + ?Sized + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .field("events", &self.events.is_some())
            .finish()
    }
}

impl<Q> Worker<Q>
where
    Q: QueueStore + ?Sized + 'static,
{
    pub fn new(config: WorkerConfig, queue: Arc<Q>, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            config,
            queue,
            handlers,
            events: None,
        }
    }

    /// Publish lifecycle events to `events`.
    pub fn with_events(mut self, events: InProcEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Cancellation is only observed between jobs: a job that is executing
    /// finishes and is reported before this returns.
    pub async fn run(self, shutdown: ShutdownToken) -> WorkerStats {
        let mut stats = WorkerStats::default();
        info!(worker_id = %self.config.worker_id, "worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.claim().await {
                Ok(Some(job)) => {
                    stats.claimed += 1;
                    self.process(job, &mut stats).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
                Err(err) => {
                    warn!(worker_id = %self.config.worker_id, error = %err, "dequeue error");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.config.error_backoff()) => {}
                    }
                }
            }
        }

        info!(
            worker_id = %self.config.worker_id,
            claimed = stats.claimed,
            completed = stats.completed,
            retried = stats.retried,
            failed = stats.failed,
            lost = stats.lost,
            "worker stopped"
        );
        stats
    }

    /// Claim the next job this worker can handle.
    pub async fn claim(&self) -> Result<Option<Job>, QueueError> {
        let job_types = self
            .config
            .job_types
            .clone()
            .unwrap_or_else(|| self.handlers.job_types());
        let request = DequeueRequest::new(self.config.worker_id.clone()).with_job_types(job_types);
        self.queue.dequeue(request).await
    }

    /// Execute a claimed job and report the outcome against its claim.
    pub async fn process(&self, job: Job, stats: &mut WorkerStats) {
        let Some(claim) = job.claim() else {
            error!(job_id = %job.id, "dequeued job carries no claim; skipping");
            return;
        };
        let timing = telemetry::record_job_start(job.id.to_string());
        self.publish(&job, JobEventPayload::Claimed {
            attempts: job.attempts,
        });

        match self.execute(&job).await {
            Ok(()) => {
                let claim = &claim;
                match self.report(move || self.queue.complete_claim(claim)).await {
                    Ok(()) => {
                        stats.completed += 1;
                        let duration = telemetry::record_job_finished(timing, &job.job_type, "completed");
                        self.publish(&job, JobEventPayload::Completed {
                            duration_ms: duration.as_millis() as u64,
                        });
                    }
                    Err(QueueError::ClaimLost { status, .. }) => {
                        telemetry::record_job_finished(timing, &job.job_type, "lost");
                        self.claim_lost(&job, status, stats);
                    }
                    Err(err) => self.report_failed(&job, err),
                }
            }
            Err(handler_err) => {
                debug!(
                    job_id = %job.id,
                    retryable = handler_err.retryable,
                    error = %handler_err,
                    "handler failed"
                );
                let claim = &claim;
                let message = handler_err.message.as_str();
                let retryable = handler_err.retryable;
                match self
                    .report(move || self.queue.fail_claim(claim, message, retryable))
                    .await
                {
                    Ok(FailOutcome::Retrying { attempts, run_at }) => {
                        stats.retried += 1;
                        telemetry::record_job_finished(timing, &job.job_type, "retrying");
                        self.publish(&job, JobEventPayload::Retrying {
                            attempts,
                            run_at,
                            error: handler_err.message.clone(),
                        });
                    }
                    Ok(FailOutcome::Failed { attempts }) => {
                        stats.failed += 1;
                        telemetry::record_job_finished(timing, &job.job_type, "failed");
                        self.publish(&job, JobEventPayload::Failed {
                            attempts,
                            error: handler_err.message.clone(),
                        });
                    }
                    Ok(FailOutcome::Unchanged { status }) => {
                        telemetry::record_job_finished(timing, &job.job_type, "lost");
                        self.claim_lost(&job, status, stats);
                    }
                    Err(err) => self.report_failed(&job, err),
                }
            }
        }
    }

    /// Run the handler for `job` on its own task so a panic is contained.
    async fn execute(&self, job: &Job) -> Result<(), HandlerError> {
        let Some(handler) = self.handlers.get(&job.job_type) else {
            return Err(HandlerError::permanent(format!(
                "no handler registered for job type {}",
                job.job_type
            )));
        };

        let task_job = job.clone();
        let task = telemetry::instrument_execute(
            job.id.to_string(),
            job.job_type.clone(),
            self.config.worker_id.clone(),
            async move { handler.handle(&task_job).await },
        );

        match tokio::spawn(task).await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                let panic = join_err.into_panic();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(job_id = %job.id, panic = %message, "handler panicked");
                Err(HandlerError::retryable(format!("handler panicked: {message}")))
            }
            Err(join_err) => Err(HandlerError::retryable(format!(
                "handler task aborted: {join_err}"
            ))),
        }
    }

    /// Retry a store call on storage errors with a doubling delay.
    async fn report<T, F, Fut>(&self, mut call: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut delay = self.config.error_backoff();
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_permanent() => return Err(err),
                Err(err) if attempt < self.config.report_retries => {
                    attempt += 1;
                    warn!(
                        worker_id = %self.config.worker_id,
                        attempt,
                        error = %err,
                        "report failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn claim_lost(&self, job: &Job, status: JobStatus, stats: &mut WorkerStats) {
        stats.lost += 1;
        warn!(
            job_id = %job.id,
            worker_id = %self.config.worker_id,
            %status,
            "claim was reclaimed by the stale-claim sweep; outcome discarded"
        );
        self.publish(job, JobEventPayload::ClaimLost { status });
    }

    fn report_failed(&self, job: &Job, err: QueueError) {
        error!(
            job_id = %job.id,
            worker_id = %self.config.worker_id,
            error = %err,
            "could not report job outcome; leaving it to the stale-claim sweep"
        );
        self.publish(job, JobEventPayload::ReportFailed {
            error: err.to_string(),
        });
    }

    fn publish(&self, job: &Job, payload: JobEventPayload) {
        if let Some(events) = &self.events {
            events.publish(JobEvent::new(
                job.id,
                job.job_type.clone(),
                Some(self.config.worker_id.clone()),
                payload,
            ));
        }
    }
}
