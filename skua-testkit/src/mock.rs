use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use skua::{HandlerError, Job, JobHandler, JobId};

/// Handler that records each execution and returns scripted results.
///
/// Results queued with [`MockHandler::push_result`] are returned first, one
/// per execution; after that every execution returns the default result.
#[derive(Clone)]
pub struct MockHandler {
    records: Arc<Mutex<Vec<HandlerRecord>>>,
    script: Arc<Mutex<VecDeque<Result<(), HandlerError>>>>,
    default: Arc<Mutex<Result<(), HandlerError>>>,
    delay: Option<Duration>,
    panic_message: Option<String>,
}

#[derive(Clone, Debug)]
pub struct HandlerRecord {
    pub job_id: JobId,
    pub job_type: String,
    pub attempts: i32,
    pub payload: serde_json::Value,
    pub worker_id: Option<String>,
}

impl MockHandler {
    pub fn new() -> Self {
        Self::with_result(Ok(()))
    }

    pub fn with_result(result: Result<(), HandlerError>) -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            default: Arc::new(Mutex::new(result)),
            delay: None,
            panic_message: None,
        }
    }

    /// Fail every execution.
    pub fn failing(error: HandlerError) -> Self {
        Self::with_result(Err(error))
    }

    /// Panic on every execution after recording it.
    pub fn panicking(message: impl Into<String>) -> Self {
        Self {
            panic_message: Some(message.into()),
            ..Self::new()
        }
    }

    /// Sleep for `delay` before returning.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_result(&self, result: Result<(), HandlerError>) {
        self.script.lock().push_back(result);
    }

    pub fn set_default(&self, result: Result<(), HandlerError>) {
        *self.default.lock() = result;
    }

    pub fn records(&self) -> Vec<HandlerRecord> {
        self.records.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn calls_for(&self, job_id: JobId) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.job_id == job_id)
            .count()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(
            actual, expected,
            "Expected {} handler calls, got {}",
            expected, actual
        );
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl Default for MockHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for MockHandler {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        self.records.lock().push(HandlerRecord {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempts: job.attempts,
            payload: job.payload.clone(),
            worker_id: job.claimed_by.clone(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.panic_message {
            panic!("{message}");
        }

        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.default.lock().clone())
    }
}
