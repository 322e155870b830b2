use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use skua::*;

/// In-memory queue store with the same transition rules as the Postgres store.
///
/// A single mutex stands in for row locks, so every operation is atomic and
/// concurrent claims never return the same job.
#[derive(Clone)]
pub struct InMemoryQueueStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

#[derive(Default)]
struct State {
    jobs: BTreeMap<JobId, Job>,
    next_id: i64,
}

impl std::fmt::Debug for InMemoryQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueueStore")
            .field("jobs", &self.state.lock().jobs.len())
            .field("config", &self.config)
            .finish()
    }
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock: Arc::new(SystemClock),
            config: QueueConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Snapshot of every row, ordered by id.
    pub fn jobs(&self) -> Vec<Job> {
        self.state.lock().jobs.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_in(&self, status: JobStatus) -> usize {
        self.state
            .lock()
            .jobs
            .values()
            .filter(|job| job.status == status)
            .count()
    }

    fn insert(state: &mut State, request: EnqueueRequest, max_attempts: i32, now: DateTime<Utc>) -> JobId {
        state.next_id += 1;
        let id = JobId(state.next_id);
        let delay = request.delay.max(Duration::zero());
        let status = request.initial_status();

        state.jobs.insert(
            id,
            Job {
                id,
                job_type: request.job_type,
                payload: request.payload,
                priority: request.priority,
                run_at: now + delay,
                status,
                claimed_by: None,
                claimed_at: None,
                attempts: 0,
                max_attempts,
                last_error: None,
                created_at: now,
                updated_at: now,
                finished_at: None,
            },
        );
        id
    }

    fn complete_row(&self, job_id: JobId, claim: Option<&Claim>) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::UnknownJob(job_id))?;

        match job.status {
            JobStatus::Processing if held_by(job, claim) => {
                job.status = JobStatus::Completed;
                job.claimed_by = None;
                job.claimed_at = None;
                job.updated_at = now;
                job.finished_at = Some(now);
                Ok(())
            }
            JobStatus::Completed => Ok(()),
            status if claim.is_some() => Err(QueueError::ClaimLost { id: job_id, status }),
            status => Err(QueueError::InvalidTransition {
                id: job_id,
                status,
                operation: "complete",
            }),
        }
    }

    fn fail_row(
        &self,
        job_id: JobId,
        claim: Option<&Claim>,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::UnknownJob(job_id))?;

        if job.status.is_terminal() {
            return Ok(FailOutcome::Unchanged { status: job.status });
        }
        if job.status != JobStatus::Processing || !held_by(job, claim) {
            if claim.is_some() {
                return Ok(FailOutcome::Unchanged { status: job.status });
            }
            return Err(QueueError::InvalidTransition {
                id: job_id,
                status: job.status,
                operation: "fail",
            });
        }

        let policy = self.config.retry_policy();
        Ok(Self::apply_failure(job, error, retryable, now, &policy).into())
    }

    fn apply_failure(
        job: &mut Job,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> FailureDecision {
        let decision = decide_failure(job.attempts, job.max_attempts, retryable, now, policy);

        match &decision {
            FailureDecision::Retry {
                attempts,
                status,
                run_at,
            } => {
                job.attempts = *attempts;
                job.status = *status;
                job.run_at = *run_at;
            }
            FailureDecision::Fail { attempts } => {
                job.attempts = *attempts;
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
            }
        }
        job.claimed_by = None;
        job.claimed_at = None;
        job.last_error = Some(error.to_string());
        job.updated_at = now;

        decision
    }
}

/// Unfenced reports always pass.
fn held_by(job: &Job, claim: Option<&Claim>) -> bool {
    claim.map_or(true, |c| c.holds(job.claimed_by.as_deref(), job.claimed_at))
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, QueueError> {
        let max_attempts = request.validate(self.config.default_max_attempts)?;
        let (job_type, priority) = (request.job_type.clone(), request.priority);

        let id = {
            let mut state = self.state.lock();
            Self::insert(&mut state, request, max_attempts, self.clock.now())
        };

        skua::telemetry::record_job_enqueued(&job_type, priority);
        Ok(id)
    }

    async fn enqueue_many(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> Result<Vec<JobId>, QueueError> {
        let max_attempts = requests
            .iter()
            .map(|r| r.validate(self.config.default_max_attempts))
            .collect::<Result<Vec<_>, _>>()?;

        let now = self.clock.now();
        let mut state = self.state.lock();
        Ok(requests
            .into_iter()
            .zip(max_attempts)
            .map(|(request, max_attempts)| {
                skua::telemetry::record_job_enqueued(&request.job_type, request.priority);
                Self::insert(&mut state, request, max_attempts, now)
            })
            .collect())
    }

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<Job>, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let next = state
            .jobs
            .values()
            .filter(|job| job.is_eligible(now) && request.accepts(&job.job_type))
            .min_by_key(|job| (Reverse(job.priority), job.run_at, job.id))
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };

        job.status = JobStatus::Processing;
        job.claimed_by = Some(request.worker_id);
        job.claimed_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: JobId) -> Result<(), QueueError> {
        self.complete_row(job_id, None)
    }

    async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        self.fail_row(job_id, None, error, retryable)
    }

    async fn complete_claim(&self, claim: &Claim) -> Result<(), QueueError> {
        self.complete_row(claim.job_id, Some(claim))
    }

    async fn fail_claim(
        &self,
        claim: &Claim,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        self.fail_row(claim.job_id, Some(claim), error, retryable)
    }

    async fn job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.state.lock().jobs.get(&job_id).cloned())
    }
}

#[async_trait]
impl StaleClaimScanner for InMemoryQueueStore {
    async fn requeue_stale_claims(&self, timeout: Duration) -> Result<u64, QueueError> {
        let now = self.clock.now();
        let cutoff = now - timeout;
        let policy = self.config.retry_policy();
        let mut state = self.state.lock();

        let mut reclaimed = 0u64;
        for job in state.jobs.values_mut() {
            let stale = job.status == JobStatus::Processing
                && job.claimed_at.is_some_and(|at| at < cutoff);
            if stale {
                Self::apply_failure(job, CLAIM_EXPIRED, true, now, &policy);
                reclaimed += 1;
            }
        }

        drop(state);
        skua::telemetry::record_stale_claims(reclaimed);
        Ok(reclaimed)
    }
}

#[async_trait]
impl QueueMonitor for InMemoryQueueStore {
    async fn queue_stats(&self) -> Result<Vec<QueueStats>, QueueError> {
        Ok(tally_stats(self.state.lock().jobs.values()))
    }

    async fn throughput(&self, window: Duration) -> Result<Vec<Throughput>, QueueError> {
        let cutoff = self.clock.now() - window;
        Ok(tally_throughput(self.state.lock().jobs.values(), cutoff))
    }
}
