use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Row identifier, assigned monotonically by the store.
///
/// Doubles as the FIFO tie-break when priority and `run_at` are equal.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct JobId(pub i64);

impl JobId {
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a job row.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `run_at` to pass.
    Scheduled,
    Ready,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Scheduled,
        JobStatus::Ready,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Ready => "ready",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// `completed` and `failed` never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether a row in this status may be claimed once `run_at` has passed.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Scheduled | JobStatus::Ready)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobStatus::Scheduled),
            "ready" => Ok(JobStatus::Ready),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(QueueError::Decode(format!("unknown job status: {other}"))),
        }
    }
}

/// A job row as stored in the queue table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub status: JobStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the row reaches `completed` or `failed`.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Deserialize the payload into a handler-specific type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        serde_json::from_value(self.payload.clone()).map_err(QueueError::from)
    }

    /// Eligible for a claim at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.run_at <= now
    }

    /// The claim this row is currently held under, if any.
    pub fn claim(&self) -> Option<Claim> {
        match (&self.claimed_by, self.claimed_at) {
            (Some(worker_id), Some(claimed_at)) => Some(Claim {
                job_id: self.id,
                worker_id: worker_id.clone(),
                claimed_at,
            }),
            _ => None,
        }
    }
}

/// One worker's hold on a `processing` row.
///
/// A job that is swept and re-claimed gets a new `claimed_at`, so reports
/// fenced by a `Claim` cannot touch a later claim on the same row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub job_id: JobId,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
}

impl Claim {
    /// Whether a row's claim columns still name this claim.
    pub fn holds(&self, claimed_by: Option<&str>, claimed_at: Option<DateTime<Utc>>) -> bool {
        claimed_by == Some(self.worker_id.as_str()) && claimed_at == Some(self.claimed_at)
    }
}

/// Parameters for inserting a new job.
#[derive(Clone, Debug)]
pub struct EnqueueRequest {
    pub job_type: String,
    pub payload: serde_json::Value,
    /// Higher values are claimed first.
    pub priority: i32,
    /// Non-positive delays enqueue the job as `ready`.
    pub delay: Duration,
    /// Falls back to the store's configured default when `None`.
    pub max_attempts: Option<i32>,
}

impl EnqueueRequest {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: 0,
            delay: Duration::zero(),
            max_attempts: None,
        }
    }

    /// Build a request from any serializable payload.
    pub fn typed<T: Serialize>(
        job_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, QueueError> {
        Ok(Self::new(job_type, serde_json::to_value(payload)?))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Status the new row starts in.
    pub fn initial_status(&self) -> JobStatus {
        if self.delay > Duration::zero() {
            JobStatus::Scheduled
        } else {
            JobStatus::Ready
        }
    }

    /// Reject requests no store should accept, resolving the attempt ceiling.
    pub fn validate(&self, default_max_attempts: i32) -> Result<i32, QueueError> {
        if self.job_type.trim().is_empty() {
            return Err(QueueError::EmptyJobType);
        }
        let max_attempts = self.max_attempts.unwrap_or(default_max_attempts);
        if max_attempts < 1 {
            return Err(QueueError::InvalidMaxAttempts(max_attempts));
        }
        Ok(max_attempts)
    }
}

/// Claim request issued by a worker.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DequeueRequest {
    /// Identity recorded in `claimed_by`.
    pub worker_id: String,
    /// Restrict the claim to these job types; `None` accepts any type.
    pub job_types: Option<Vec<String>>,
}

impl DequeueRequest {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            job_types: None,
        }
    }

    pub fn with_job_types<I, S>(mut self, job_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.job_types = Some(job_types.into_iter().map(Into::into).collect());
        self
    }

    /// Whether `job_type` passes this request's filter.
    pub fn accepts(&self, job_type: &str) -> bool {
        self.job_types
            .as_ref()
            .map_or(true, |types| types.iter().any(|t| t == job_type))
    }
}
