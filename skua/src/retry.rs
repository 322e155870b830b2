use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

/// Exponential backoff applied to retryable failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in milliseconds. Zero requeues failed jobs as `ready` immediately.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_backoff_ms: 300_000, // 5 minutes
        }
    }
}

impl RetryPolicy {
    /// Requeue immediately, without backoff.
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_backoff_ms: 0,
        }
    }
}

/// Computes the delay before a retried job becomes eligible again.
///
/// Formula: delay = min(base_delay * 2^(attempts-1), max_backoff)
///
/// # Arguments
/// * `attempts` - The attempt count after recording the current failure
/// * `policy` - The retry policy
pub fn compute_backoff(attempts: i32, policy: &RetryPolicy) -> Duration {
    if attempts <= 0 || policy.base_delay_ms == 0 {
        return Duration::zero();
    }

    let exp = attempts.saturating_sub(1).min(62);
    let scaled = (policy.base_delay_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(policy.max_backoff_ms as f64);

    Duration::milliseconds(capped.max(0.0) as i64)
}

/// Whether another attempt is allowed for a job that has failed
/// `attempts_before` times prior to the current failure.
pub fn can_retry(retryable: bool, attempts_before: i32, max_attempts: i32) -> bool {
    retryable && attempts_before < max_attempts
}

/// Outcome of the retry state machine for one failure.
#[derive(Clone, Debug, PartialEq)]
pub enum FailureDecision {
    /// Requeue with the given status and eligibility time.
    Retry {
        attempts: i32,
        status: JobStatus,
        run_at: DateTime<Utc>,
    },
    /// Terminal failure.
    Fail { attempts: i32 },
}

/// Decide the next state of a `processing` job that just failed.
///
/// Every failure path (handler errors, missing handlers, stale claims)
/// goes through here, so the Postgres and in-memory stores agree.
pub fn decide_failure(
    attempts_before: i32,
    max_attempts: i32,
    retryable: bool,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
) -> FailureDecision {
    let attempts = attempts_before.saturating_add(1);

    if !can_retry(retryable, attempts_before, max_attempts) {
        return FailureDecision::Fail { attempts };
    }

    let delay = compute_backoff(attempts, policy);
    let status = if delay > Duration::zero() {
        JobStatus::Scheduled
    } else {
        JobStatus::Ready
    };

    FailureDecision::Retry {
        attempts,
        status,
        run_at: now + delay,
    }
}

/// Result reported back to the caller of `fail`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FailOutcome {
    /// Job requeued for another attempt.
    Retrying {
        attempts: i32,
        run_at: DateTime<Utc>,
    },
    /// Job moved to terminal `failed`.
    Failed { attempts: i32 },
    /// Job was already terminal; nothing changed.
    Unchanged { status: JobStatus },
}

impl From<FailureDecision> for FailOutcome {
    fn from(decision: FailureDecision) -> Self {
        match decision {
            FailureDecision::Retry {
                attempts, run_at, ..
            } => FailOutcome::Retrying { attempts, run_at },
            FailureDecision::Fail { attempts } => FailOutcome::Failed { attempts },
        }
    }
}
