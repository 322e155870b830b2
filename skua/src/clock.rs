use chrono::{DateTime, Utc};

/// Source of "now" for stores that keep time in-process.
///
/// The Postgres store uses the database clock (`NOW()`) instead, so every
/// worker compares `run_at` against the same time source.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
