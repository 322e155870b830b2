use crate::job::{JobId, JobStatus};

/// Errors returned by queue store operations.
///
/// "No job available" is not an error; `dequeue` returns `Ok(None)` for it.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The id does not exist. Indicates a caller bug.
    #[error("unknown job: {0}")]
    UnknownJob(JobId),
    /// The row exists but cannot take the requested transition from its status.
    #[error("job {id} cannot transition from {status} via {operation}")]
    InvalidTransition {
        id: JobId,
        status: JobStatus,
        operation: &'static str,
    },
    /// The row is no longer held by the claim the caller reported on; the
    /// stale-claim sweep took it back.
    #[error("job {id} is no longer held by this claim (now {status})")]
    ClaimLost { id: JobId, status: JobStatus },
    #[error("job_type must not be empty")]
    EmptyJobType,
    #[error("max_attempts must be at least 1, got {0}")]
    InvalidMaxAttempts(i32),
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A stored row could not be mapped back into a [`crate::Job`].
    #[error("malformed job row: {0}")]
    Decode(String),
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl QueueError {
    /// Protocol violations are caller bugs rather than storage trouble.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            QueueError::UnknownJob(_) | QueueError::InvalidTransition { .. }
        )
    }

    /// Repeating the call cannot change the answer.
    pub fn is_permanent(&self) -> bool {
        self.is_protocol_violation() || matches!(self, QueueError::ClaimLost { .. })
    }
}
