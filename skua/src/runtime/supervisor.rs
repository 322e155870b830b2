use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::events::InProcEventBus;
use crate::queue::{QueueStore, StaleClaimScanner};

use super::handler::HandlerRegistry;
use super::worker::{Worker, WorkerConfig, WorkerStats};

/// Configuration for the queue runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of worker tasks to spawn.
    pub worker_count: usize,
    /// Claims held longer than this are treated as abandoned.
    pub stale_claim_timeout_ms: u64,
    /// Interval between stale-claim sweeps.
    pub sweep_interval_ms: u64,
    /// How long `shutdown` waits for each task before giving up on it.
    pub shutdown_grace_ms: u64,
    /// Template for every worker. Worker ids get a `-w{n}` suffix.
    pub worker: WorkerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            stale_claim_timeout_ms: 300_000,
            sweep_interval_ms: 30_000,
            shutdown_grace_ms: 30_000,
            worker: WorkerConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_stale_claim_timeout_ms(mut self, ms: u64) -> Self {
        self.stale_claim_timeout_ms = ms;
        self
    }

    pub fn with_sweep_interval_ms(mut self, ms: u64) -> Self {
        self.sweep_interval_ms = ms;
        self
    }

    pub fn with_shutdown_grace_ms(mut self, ms: u64) -> Self {
        self.shutdown_grace_ms = ms;
        self
    }

    pub fn stale_claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.stale_claim_timeout_ms.min(i64::MAX as u64) as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent `cancel` is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a pool of workers and the stale-claim sweeper against one store.
pub struct QueueRuntime<Q>
where
    Q: QueueStore + StaleClaimScanner + 'static,
{
    config: RuntimeConfig,
    queue: Arc<Q>,
    handlers: Arc<HandlerRegistry>,
    events: Option<InProcEventBus>,
    shutdown_token: ShutdownToken,
    worker_handles: Mutex<Vec<JoinHandle<WorkerStats>>>,
    sweeper_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<Q> fmt::Debug for QueueRuntime<Q>
where
    Q: QueueStore + StaleClaimScanner + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRuntime")
            .field("config", &self.config)
            .field("queue_type", &type_name::<Q>())
            .field("handlers", &self.handlers)
            .field("events", &self.events)
            .field("cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl<Q> QueueRuntime<Q>
where
    Q: QueueStore + StaleClaimScanner + 'static,
{
    pub fn new(
        config: RuntimeConfig,
        queue: Arc<Q>,
        handlers: Arc<HandlerRegistry>,
        events: Option<InProcEventBus>,
    ) -> Self {
        Self {
            config,
            queue,
            handlers,
            events,
            shutdown_token: ShutdownToken::new(),
            worker_handles: Mutex::new(Vec::new()),
            sweeper_handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<Q> {
        Arc::clone(&self.queue)
    }

    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.handlers)
    }

    pub fn events(&self) -> Option<&InProcEventBus> {
        self.events.as_ref()
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Spawn the configured workers and the stale-claim sweeper.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.shutdown_token.is_cancelled() {
            anyhow::bail!("runtime already shut down");
        }
        if !self.worker_handles.lock().await.is_empty() {
            anyhow::bail!("runtime already started");
        }

        self.spawn_workers(self.config.worker_count).await;
        self.spawn_sweeper().await;

        tracing::info!(
            workers = self.config.worker_count,
            job_types = ?self.handlers.job_types(),
            "queue runtime started"
        );
        Ok(())
    }

    /// Spawn `count` additional workers.
    pub async fn spawn_workers(&self, count: usize) {
        let mut handles = self.worker_handles.lock().await;
        let base_id = self.config.worker.worker_id.clone();

        for _ in 0..count {
            let mut config = self.config.worker.clone();
            config.worker_id = format!("{}-w{}", base_id, handles.len());

            let mut worker = Worker::new(config, self.queue(), self.handlers());
            if let Some(events) = &self.events {
                worker = worker.with_events(events.clone());
            }

            let shutdown = self.shutdown_token.clone();
            handles.push(tokio::spawn(worker.run(shutdown)));
        }
    }

    /// Spawn the periodic stale-claim sweep. A second call is a no-op.
    pub async fn spawn_sweeper(&self) {
        let mut slot = self.sweeper_handle.lock().await;
        if slot.is_some() {
            return;
        }

        let q = self.queue();
        let interval = self.config.sweep_interval();
        let timeout = self.config.stale_claim_timeout();
        let shutdown = self.shutdown_token.clone();

        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Stale-claim sweeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match q.requeue_stale_claims(timeout).await {
                            Ok(0) => {}
                            Ok(count) => tracing::info!(count, "requeued stale claims"),
                            Err(err) => tracing::warn!("stale-claim sweep error: {err}"),
                        }
                    }
                }
            }
        }));
    }

    /// Stop claiming, let in-flight jobs finish, and join every task.
    ///
    /// Returns the summed statistics of the workers that stopped within the
    /// grace period.
    pub async fn shutdown(&self) -> anyhow::Result<WorkerStats> {
        tracing::info!("Initiating graceful shutdown of queue runtime");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        let sweeper = self.sweeper_handle.lock().await.take();

        let grace = self.config.shutdown_grace();
        let mut total = WorkerStats::default();

        for handle in handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(stats)) => total += stats,
                Ok(Err(e)) => tracing::warn!("Worker task failed: {:?}", e),
                Err(_) => tracing::warn!("Worker task timed out during shutdown"),
            }
        }

        if let Some(handle) = sweeper {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Sweeper task failed: {:?}", e),
                Err(_) => tracing::warn!("Sweeper task timed out during shutdown"),
            }
        }

        tracing::info!(
            claimed = total.claimed,
            completed = total.completed,
            retried = total.retried,
            failed = total.failed,
            lost = total.lost,
            "Queue runtime shutdown complete"
        );
        Ok(total)
    }

    /// Start, wait for `signal`, then shut down.
    pub async fn run_until<F>(&self, signal: F) -> anyhow::Result<WorkerStats>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        self.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::task::yield_now().await;
        token.cancel();

        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter task should not panic");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_after_cancel() {
        let token = ShutdownToken::default();
        token.cancel();
        timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already cancelled token should not block");
    }

    #[test]
    fn test_runtime_config_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.stale_claim_timeout(), chrono::Duration::seconds(300));
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(30));
        assert_eq!(config.worker_count, 4);
    }
}
