//! Scheduler errors.

use thiserror::Error;
use uuid::Uuid;

/// Scheduler error types.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Malformed schedule definition, rejected before any write.
    #[error("Invalid schedule: {0}")]
    Validation(String),

    /// Schedule not found.
    #[error("Schedule not found: {0}")]
    NotFound(Uuid),

    /// The cron expression does not parse.
    #[error("Invalid cron expression: {0}")]
    Cron(#[from] cron::error::Error),

    /// The underlying store failed.
    #[error("Storage error: {0}")]
    Storage(String),
}
