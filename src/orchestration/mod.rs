//! Orchestration layer: from a validated pipeline to a finished run.
//!
//! The resolver turns a pipeline into an instance DAG, the scheduler drains
//! it through the worker pool, and each worker runs a stage executor followed
//! by the sanity gate.

mod executor;
mod gate;
mod pool;
mod resolver;
mod scheduler;

pub use executor::{
    ProcessExecutor, StageExecutor, StageJob, StageOutput, UpstreamOutput, STDERR_LOG, STDOUT_LOG,
};
pub use gate::{SanityGate, Verdict};
pub use pool::{WorkerEvent, WorkerPool};
pub use resolver::{ExecutionPlan, Resolver};
pub use scheduler::{Scheduler, SchedulerEvent};
