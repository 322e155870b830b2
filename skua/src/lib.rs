//! Skua - transactional job queue over a shared relational table.
//!
//! Producers insert jobs; any number of workers poll the same table, claim one
//! eligible job at a time, run a handler and report the outcome. Claims use
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never block on, or share,
//! a row.
//!
//! # Core Concepts
//!
//! - **Job**: A row in the queue table ([`Job`]) with a `job_type`, a JSON
//!   payload, a priority and a `run_at` time. Status moves
//!   `scheduled/ready -> processing -> completed | failed`, with retries
//!   returning to `ready` or `scheduled`.
//!
//! - **Queue**: The [`QueueStore`] trait covers enqueue, claim, complete and
//!   fail. [`StaleClaimScanner`] reclaims jobs whose worker disappeared and
//!   [`QueueMonitor`] aggregates counts for observability.
//!
//! - **Retry**: [`decide_failure`] is the single retry state machine, shared by
//!   every store and by the stale-claim sweep.
//!
//! - **Runtime**: [`QueueRuntime`] runs a pool of [`Worker`]s plus the
//!   periodic sweep, and drains in-flight jobs on shutdown.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL store via sqlx
//! - `metrics` - Prometheus metrics
//! - `subscriber` - `tracing-subscriber` setup helper
//!
//! # Example
//!
//! ```ignore
//! use skua::*;
//! use skua::persistence::{connect, PostgresQueueStore};
//!
//! let pool = connect(&PersistenceConfig::from_env()?).await?;
//! let store = Arc::new(PostgresQueueStore::new(pool, QueueConfig::default()));
//! store.migrate().await?;
//!
//! store
//!     .enqueue(EnqueueRequest::new("send_email", json!({"to": "a@example.com"})).with_priority(1))
//!     .await?;
//!
//! let runtime = RuntimeBuilder::new(RuntimeConfig::default())
//!     .with_queue(store)
//!     .with_handler("send_email", SimulatedWorkHandler::for_job_type("send_email"))
//!     .build()?;
//! runtime.start().await?;
//! ```

/// Time source for in-process stores.
pub mod clock;

/// Configuration structures for queue and persistence settings.
///
/// The `config` module defines [`PersistenceConfig`] and [`QueueConfig`].
pub mod config;

/// Typed errors for queue store operations.
pub mod error;

/// Job lifecycle events and the in-process event bus.
pub mod events;

/// Job rows, statuses and request types.
///
/// - [`Job`] - a stored job row
/// - [`JobId`] - store-assigned identifier
/// - [`JobStatus`] - lifecycle state
/// - [`EnqueueRequest`] / [`DequeueRequest`] - operation inputs
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides [`persistence::PostgresQueueStore`]
/// and pool setup when the `postgres` feature is enabled.
pub mod persistence;

/// Queue store, stale-claim and monitor traits plus statistics types.
pub mod queue;

/// Retry decisions and exponential backoff.
pub mod retry;

/// Runtime orchestration and worker management.
///
/// - [`QueueRuntime`] - worker pool plus stale-claim sweeper
/// - [`RuntimeConfig`] - runtime configuration
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`JobHandler`] and [`HandlerRegistry`] - job execution
/// - [`WorkerConfig`] - individual worker configuration
/// - [`RuntimeBuilder`] - constructs runtimes
pub mod runtime;

/// Tracing spans and lifecycle recorders.
pub mod telemetry;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use job::*;
pub use queue::*;
pub use retry::*;
pub use runtime::*;
