//! Background job queue with bounded retry and dead-lettering.
//!
//! - `JobQueue`: at-least-once delivery over store lists, with leases on
//!   dequeued jobs and reclamation of leases that run out
//! - `JobWorker`: consumer loop dispatching jobs to handlers by kind
//! - Types: `Job`, `NewJob`, `JobKind`, dead-letter entries and stats

pub mod queue;
pub mod types;
pub mod worker;

pub use queue::JobQueue;
pub use types::{
    DeadLetterEntry, FailOutcome, InFlightRecord, Job, JobKind, NewJob, QueueStats, Receipt,
};
pub use worker::{JobHandler, JobResult, JobWorker, JobWorkerConfig, WorkerHandle, WorkerStats};
