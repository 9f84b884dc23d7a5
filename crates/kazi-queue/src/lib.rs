//! # Kazi Queue
//!
//! Priority job queue over a shared durable store.
//!
//! ## Features
//!
//! - Priority-then-FIFO claiming with an atomic compare-and-swap
//! - Delayed execution (`delay_until`)
//! - Bounded retry with configurable backoff
//! - Cancellation of queued jobs and lease reaping for dead workers
//! - Stats, bulk failed-job retry and completed-job purge
//! - Worker pool that polls, dispatches to registered handlers and
//!   reports completion or failure

pub mod backoff;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod worker;

pub use backoff::RetryBackoff;
pub use config::QueueConfig;
pub use engine::QueueEngine;
pub use error::QueueError;
pub use job::{FailOutcome, Job, JobFilter, JobStatus, NewJob, QueueStats};
pub use worker::{JobHandler, JobRegistry, RunHandle, Worker, WorkerPool};
