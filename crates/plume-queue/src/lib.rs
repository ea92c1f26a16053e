//! Durable delayed job queue for plume.
//!
//! This crate provides a SQLite-backed queue that:
//! - Holds jobs invisible until their delay elapses
//! - Delivers each due job to one worker at a time under a lease
//! - Redelivers jobs whose lease lapses (crashed or stuck workers)
//! - Retries failed jobs with bounded exponential backoff
//! - Dead-letters jobs that exhaust their attempts
//! - Survives process restarts

mod error;
mod queue;
mod runner;
mod types;

pub use error::QueueError;
pub use queue::JobQueue;
pub use runner::{DeadLetterHook, JobHandler, PoolConfig, RunOutcome, WorkerPool};
pub use types::{
    FailOutcome, Job, JobHandle, JobStatus, NewJob, QueueConfig, QueueStats, RetryPolicy,
};
