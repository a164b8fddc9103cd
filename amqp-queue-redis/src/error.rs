//! Redis view errors.

use amqp_queue::ViewError;
use thiserror::Error;

/// Result type for Redis view operations.
pub type RedisViewResult<T> = Result<T, RedisViewError>;

/// Redis view errors.
#[derive(Error, Debug)]
pub enum RedisViewError {
    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Snapshot could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<RedisViewError> for ViewError {
    fn from(err: RedisViewError) -> Self {
        match err {
            RedisViewError::Serialization(e) => ViewError::Serialization(e.to_string()),
            other => ViewError::Storage(other.to_string()),
        }
    }
}
