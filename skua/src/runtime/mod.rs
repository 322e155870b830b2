/// Runtime builder for constructing queue runtimes.
pub mod builder;
/// Job handlers and the registry that maps job types to them.
pub mod handler;
/// Runtime supervisor managing the worker pool and stale-claim sweep.
pub mod supervisor;
/// Polling worker and its configuration.
pub mod worker;

pub use builder::RuntimeBuilder;
pub use handler::{
    payload_sampler, HandlerError, HandlerRegistry, JobHandler, Sampler, SimulatedWorkHandler,
};
pub use supervisor::{QueueRuntime, RuntimeConfig, ShutdownToken};
pub use worker::{Worker, WorkerConfig, WorkerStats};
