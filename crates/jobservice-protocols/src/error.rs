//! Error taxonomy shared by every job service component.

use thiserror::Error;

/// Errors surfaced by job service operations.
#[derive(Debug, Error)]
pub enum JobServiceError {
    /// Malformed input: empty id, invalid URL, invalid cron, unknown command.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The object already exists; `conflicting_id` names the existing one.
    #[error("Conflict: {message}")]
    Conflict {
        message: String,
        conflicting_id: String,
    },

    /// Unknown job, policy or numeric policy id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Key-value store failure.
    #[error("KV store error: {0}")]
    Kv(String),

    /// Status hook delivery failure.
    #[error("Hook error: {0}")]
    Hook(String),

    /// JSON encoding or decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cron expression could not be parsed.
    #[error("Invalid cron spec '{spec}': {message}")]
    Cron { spec: String, message: String },

    /// Unrecoverable startup failure.
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobServiceError {
    /// Build a conflict error carrying the id of the existing object.
    pub fn conflict(message: impl Into<String>, conflicting_id: impl Into<String>) -> Self {
        JobServiceError::Conflict {
            message: message.into(),
            conflicting_id: conflicting_id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, JobServiceError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, JobServiceError::Conflict { .. })
    }

    /// Id of the conflicting object, if this is a conflict.
    pub fn conflicting_id(&self) -> Option<&str> {
        match self {
            JobServiceError::Conflict { conflicting_id, .. } => Some(conflicting_id),
            _ => None,
        }
    }
}

/// Result type for job service operations.
pub type JobServiceResult<T> = Result<T, JobServiceError>;

/// Outcome of a job handler run that did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// The job honoured a stop command. Never retried.
    #[error("job is stopped")]
    Stopped,

    /// The job honoured a cancel command. Retry stays allowed.
    #[error("job is cancelled")]
    Cancelled,

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }
}

impl From<JobServiceError> for JobError {
    fn from(err: JobServiceError) -> Self {
        JobError::Failed(err.to_string())
    }
}
