//! Error types for the pipeline.

use plume_providers::PublishError;
use plume_queue::QueueError;
use plume_store::StoreError;
use thiserror::Error;

/// Errors surfaced by orchestrator operations and job execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The post or attempt does not exist for the caller.
    #[error("{0} not found")]
    NotFound(String),

    /// The operation is not allowed in the current status.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Bad input.
    #[error("invalid input: {0}")]
    Validation(String),

    /// A provider failure the queue should retry.
    #[error("transient provider failure: {0}")]
    Provider(#[from] PublishError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::PostNotFound(id) => Self::NotFound(format!("post {}", id)),
            StoreError::AttemptNotFound(id) => Self::NotFound(format!("publish attempt {}", id)),
            err @ StoreError::InvalidState { .. } => Self::InvalidState(err.to_string()),
            err @ StoreError::EmptyPost => Self::Validation(err.to_string()),
            other => Self::Store(other),
        }
    }
}
