//! Error types for the job queue.

use thiserror::Error;

/// Errors that can occur in queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// SQLite error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Payload could not be encoded or decoded.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// A stored row could not be interpreted.
    #[error("corrupt job row: {0}")]
    Corrupt(String),
}
