use std::collections::HashMap;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::job::Job;

/// Executes jobs of one `job_type`.
///
/// Handlers run at least once per claim; a worker that dies after the handler
/// finished but before reporting leaves the job to be re-run, so side effects
/// should be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError>;
}

/// Failure reported by a handler.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// Whether the job may be attempted again.
    pub retryable: bool,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// A payload that does not decode will not decode on the next attempt either.
impl From<QueueError> for HandlerError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Serialization(_) | QueueError::Decode(_) => Self::permanent(err.to_string()),
            other => Self::retryable(other.to_string()),
        }
    }
}

/// Maps `job_type` to the handler that executes it.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any previous handler.
    pub fn register<H>(&mut self, job_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    /// Register an already shared handler.
    pub fn register_arc(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> &mut Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    pub fn with<H>(mut self, job_type: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.register(job_type, handler);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Returns a value in `[0, 1)` for a job.
pub type Sampler = Arc<dyn Fn(&Job) -> f64 + Send + Sync>;

/// Deterministic sampler derived from the job id and payload.
pub fn payload_sampler() -> Sampler {
    Arc::new(|job: &Job| {
        let mut hasher = DefaultHasher::new();
        job.id.hash(&mut hasher);
        job.payload.to_string().hash(&mut hasher);
        (hasher.finish() % 10_000) as f64 / 10_000.0
    })
}

/// Stand-in handler that sleeps for a while and fails some share of jobs.
///
/// One sample per execution picks both the duration, interpolated between
/// the bounds, and whether the job fails (`sample < failure_probability`).
/// Failures are retryable.
#[derive(Clone)]
pub struct SimulatedWorkHandler {
    min_duration: Duration,
    max_duration: Duration,
    failure_probability: f64,
    sampler: Sampler,
}

impl fmt::Debug for SimulatedWorkHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedWorkHandler")
            .field("min_duration", &self.min_duration)
            .field("max_duration", &self.max_duration)
            .field("failure_probability", &self.failure_probability)
            .finish_non_exhaustive()
    }
}

impl Default for SimulatedWorkHandler {
    fn default() -> Self {
        Self {
            min_duration: Duration::from_millis(500),
            max_duration: Duration::from_millis(2000),
            failure_probability: 0.05,
            sampler: payload_sampler(),
        }
    }
}

impl SimulatedWorkHandler {
    pub fn new(min_duration: Duration, max_duration: Duration) -> Self {
        Self {
            min_duration,
            max_duration: max_duration.max(min_duration),
            ..Self::default()
        }
    }

    /// Typical processing times for the demo job types.
    pub fn for_job_type(job_type: &str) -> Self {
        let (min_ms, max_ms) = match job_type {
            "send_email" => (500, 2000),
            "process_payment" => (1000, 3000),
            "generate_report" => (2000, 5000),
            "resize_image" => (800, 2500),
            "send_sms" => (300, 1000),
            _ => (500, 2000),
        };
        Self::new(Duration::from_millis(min_ms), Duration::from_millis(max_ms))
    }

    pub fn with_failure_probability(mut self, probability: f64) -> Self {
        self.failure_probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    /// Multiply both duration bounds, e.g. `0.01` for fast demos.
    pub fn scaled(mut self, factor: f64) -> Self {
        let factor = factor.max(0.0);
        self.min_duration = self.min_duration.mul_f64(factor);
        self.max_duration = self.max_duration.mul_f64(factor);
        self
    }

    pub fn duration_for(&self, sample: f64) -> Duration {
        let span = self.max_duration.saturating_sub(self.min_duration);
        self.min_duration + span.mul_f64(sample.clamp(0.0, 1.0))
    }
}

#[async_trait]
impl JobHandler for SimulatedWorkHandler {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let sample = (self.sampler)(job);
        tokio::time::sleep(self.duration_for(sample)).await;

        if sample < self.failure_probability {
            return Err(HandlerError::retryable(format!(
                "simulated failure in {}",
                job.job_type
            )));
        }
        Ok(())
    }
}
