//! Test support for skua: an in-memory [`skua::QueueStore`], a manually
//! advanced clock and handlers that record or script their results.

mod clock;
mod mock;
mod queue;

pub use clock::ManualClock;
pub use mock::{HandlerRecord, MockHandler};
pub use queue::InMemoryQueueStore;

use serde_json::json;
use skua::EnqueueRequest;

/// A ready request carrying `{"n": n}`.
pub fn numbered_request(job_type: &str, n: u64) -> EnqueueRequest {
    EnqueueRequest::new(job_type, json!({ "n": n }))
}
