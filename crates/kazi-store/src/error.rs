//! Store errors.

use thiserror::Error;

/// Store error types.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Opening the database failed.
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// A statement against the database failed.
    #[error("Query failed: {0}")]
    Query(String),
}
