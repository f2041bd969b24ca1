//! KV store errors.

use jobservice_protocols::JobServiceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    /// Could not reach the server.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Command rejected or failed on the server.
    #[error("Command error: {0}")]
    Command(String),

    /// Operation against a key holding the wrong kind of value.
    #[error("WRONGTYPE operation against key '{0}'")]
    WrongType(String),

    /// Subscription channel closed.
    #[error("Subscription closed: {0}")]
    Closed(String),
}

pub type KvResult<T> = Result<T, KvError>;

impl From<redis::RedisError> for KvError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            KvError::Connection(err.to_string())
        } else {
            KvError::Command(err.to_string())
        }
    }
}

impl From<KvError> for JobServiceError {
    fn from(err: KvError) -> Self {
        JobServiceError::Kv(err.to_string())
    }
}
