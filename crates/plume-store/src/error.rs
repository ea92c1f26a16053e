//! Error types for the state store.

use thiserror::Error;

use crate::PublishStatus;

/// Errors that can occur in state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON column could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Post does not exist or is outside the caller's scope.
    #[error("post not found: {0}")]
    PostNotFound(String),

    /// Publish attempt does not exist or belongs to a different post.
    #[error("publish attempt not found: {0}")]
    AttemptNotFound(String),

    /// Operation is not allowed in the record's current status.
    #[error("{entity} is {actual}, operation requires {expected}")]
    InvalidState {
        entity: &'static str,
        expected: &'static str,
        actual: PublishStatus,
    },

    /// The post would be left with neither text nor media.
    #[error("post needs text or at least one media item")]
    EmptyPost,

    /// A stored value could not be interpreted.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}
