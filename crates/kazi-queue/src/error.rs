//! Queue errors.

use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

/// Queue error types.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Malformed enqueue arguments, rejected before any write.
    #[error("Invalid job: {0}")]
    Validation(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    /// The job is not in a state that allows the requested transition.
    #[error("Job {id} is {actual}, expected {expected}")]
    InvalidState {
        /// Job id.
        id: Uuid,
        /// State the operation requires.
        expected: JobStatus,
        /// State the job is actually in.
        actual: JobStatus,
    },

    /// The underlying store failed.
    #[error("Storage error: {0}")]
    Storage(String),
}
