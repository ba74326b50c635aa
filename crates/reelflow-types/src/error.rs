use thiserror::Error;

use crate::job::JobDocumentError;

/// Errors a step implementation reports back to the executor.
///
/// Steps are the retry boundary: whatever a step returns here is recorded
/// verbatim in the step's execution record.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Failed(String),

    #[error("invalid output: {0}")]
    InvalidOutput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StepError {
    /// Shorthand for an ad-hoc failure message.
    pub fn failed(msg: impl Into<String>) -> Self {
        StepError::Failed(msg.into())
    }
}

/// Errors related to job document persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job '{0}' not found")]
    NotFound(String),

    #[error("job '{0}' already exists")]
    AlreadyExists(String),

    #[error("invalid job document '{job_id}': {source}")]
    Invalid {
        job_id: String,
        #[source]
        source: JobDocumentError,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
