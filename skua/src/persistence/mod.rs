/// PostgreSQL persistence for the job queue.
///
/// This module provides `PostgresQueueStore`, which implements
/// [`crate::QueueStore`], [`crate::StaleClaimScanner`] and
/// [`crate::QueueMonitor`] over the `skua_jobs` table.
pub mod postgres;

pub use postgres::{connect, PostgresQueueStore};
