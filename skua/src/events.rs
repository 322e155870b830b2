use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{JobId, JobStatus};

/// Lifecycle event published by workers, and by producers that opt in.
///
/// The stale-claim sweep does not publish; it is visible through telemetry.
/// A worker whose claim was swept reports that as [`JobEventPayload::ClaimLost`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub job_type: String,
    pub worker_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn new(
        job_id: JobId,
        job_type: impl Into<String>,
        worker_id: Option<String>,
        payload: JobEventPayload,
    ) -> Self {
        Self {
            job_id,
            job_type: job_type.into(),
            worker_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Event payload emitted for job lifecycle transitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum JobEventPayload {
    /// Job was inserted by a producer.
    Enqueued { priority: i32 },
    /// Job was claimed and is about to execute.
    Claimed { attempts: i32 },
    /// Handler succeeded and the job is completed.
    Completed { duration_ms: u64 },
    /// Handler failed; the job was requeued.
    Retrying {
        attempts: i32,
        run_at: DateTime<Utc>,
        error: String,
    },
    /// Job reached terminal `failed`.
    Failed { attempts: i32, error: String },
    /// Outcome could not be written back; the claim is left for the sweep.
    ReportFailed { error: String },
    /// The sweep took the job back before the worker reported; the outcome
    /// was discarded. `status` is the row's status at report time.
    ClaimLost { status: JobStatus },
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for subscribers. A subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged` and skips ahead.
#[derive(Clone)]
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish to all current subscribers. Events with no subscribers are dropped.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
