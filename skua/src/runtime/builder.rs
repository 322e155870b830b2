use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::events::InProcEventBus;
use crate::queue::{QueueStore, StaleClaimScanner};

use super::handler::{HandlerRegistry, JobHandler};
use super::supervisor::{QueueRuntime, RuntimeConfig};
use super::worker::WorkerConfig;

/// Builder for constructing a `QueueRuntime` with explicit dependencies.
///
/// The builder validates that a queue and at least one handler are provided
/// before constructing the runtime.
///
/// # Example
///
/// ```ignore
/// use skua::*;
///
/// let runtime = RuntimeBuilder::new(RuntimeConfig::default())
///     .with_queue(queue)
///     .with_handler("send_email", SimulatedWorkHandler::for_job_type("send_email"))
///     .with_events(InProcEventBus::default())
///     .build()?;
/// ```
pub struct RuntimeBuilder<Q>
where
    Q: QueueStore + StaleClaimScanner + 'static,
{
    config: RuntimeConfig,
    queue: Option<Arc<Q>>,
    handlers: HandlerRegistry,
    events: Option<InProcEventBus>,
}

impl<Q> fmt::Debug for RuntimeBuilder<Q>
where
    Q: QueueStore + StaleClaimScanner + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RuntimeBuilder");
        debug.field("config", &self.config);
        debug.field("queue_set", &self.queue.is_some());
        debug.field("handlers", &self.handlers);
        debug.field("events_set", &self.events.is_some());

        if self.queue.is_some() {
            debug.field("queue_type", &type_name::<Q>());
        }

        debug.finish()
    }
}

impl<Q> RuntimeBuilder<Q>
where
    Q: QueueStore + StaleClaimScanner + 'static,
{
    /// Create a new builder with the given runtime configuration.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            queue: None,
            handlers: HandlerRegistry::new(),
            events: None,
        }
    }

    /// Set the queue store.
    pub fn with_queue(mut self, queue: Arc<Q>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Register a handler for one job type.
    pub fn with_handler<H>(mut self, job_type: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.register(job_type, handler);
        self
    }

    /// Replace the handler registry.
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Set the event bus workers publish to.
    pub fn with_events(mut self, events: InProcEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count;
        self
    }

    /// Set the template every worker is configured from.
    pub fn with_worker_config(mut self, worker: WorkerConfig) -> Self {
        self.config.worker = worker;
        self
    }

    /// Build the `QueueRuntime`.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is missing, no handler is registered, or
    /// the worker count is zero.
    pub fn build(self) -> anyhow::Result<QueueRuntime<Q>> {
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue dependency missing"))?;
        if self.handlers.is_empty() {
            anyhow::bail!("at least one job handler must be registered");
        }
        if self.config.worker_count == 0 {
            anyhow::bail!("worker_count must be at least 1");
        }

        Ok(QueueRuntime::new(
            self.config,
            queue,
            Arc::new(self.handlers),
            self.events,
        ))
    }
}
