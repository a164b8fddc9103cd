//! Error types for queue operations

use thiserror::Error;

use crate::view::ViewError;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors that can occur while talking to the broker or running jobs.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// Broker unreachable or authentication failed during setup
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Business-logic failure raised by a job handler
    #[error("Handler failed: {0}")]
    Handler(String),

    /// Malformed payload or unexpected topology state
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Shutdown requested while a shutdown is already in progress,
    /// or an operation attempted after shutdown began
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    /// Broker rejected or failed an operation on an open channel
    #[error("Broker error: {0}")]
    Broker(String),

    /// Failed to encode a payload
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Persistence layer error
    #[error("View error: {0}")]
    View(#[from] ViewError),

    /// Invalid configuration or argument
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl QueueError {
    /// Build a handler failure from any displayable error.
    ///
    /// ```
    /// use amqp_queue::QueueError;
    ///
    /// let err = QueueError::handler("upstream returned 503");
    /// assert_eq!(err.to_string(), "Handler failed: upstream returned 503");
    /// ```
    pub fn handler(message: impl std::fmt::Display) -> Self {
        QueueError::Handler(message.to_string())
    }

    /// Check if this error indicates a connection issue
    pub fn is_connection_error(&self) -> bool {
        matches!(self, QueueError::Connection(_))
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::Connection(_) | QueueError::Broker(_) | QueueError::Handler(_)
        )
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            QueueError::Protocol(err.to_string())
        } else {
            QueueError::Serialization(err.to_string())
        }
    }
}

#[cfg(feature = "rabbitmq")]
impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        match err.kind() {
            lapin::ErrorKind::IOError(_) => QueueError::Connection(err.to_string()),
            lapin::ErrorKind::InvalidConnectionState(_) => QueueError::Connection(err.to_string()),
            lapin::ErrorKind::ChannelsLimitReached => QueueError::Connection(err.to_string()),
            lapin::ErrorKind::InvalidChannelState(..) => QueueError::Broker(err.to_string()),
            _ => QueueError::Broker(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(QueueError::Connection("refused".into()).is_connection_error());
        assert!(!QueueError::Protocol("bad json".into()).is_connection_error());
        assert!(QueueError::Broker("channel closed".into()).is_retryable());
        assert!(!QueueError::Shutdown("already shutting down".into()).is_retryable());
    }

    #[test]
    fn test_json_errors_map_to_protocol() {
        let err: QueueError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, QueueError::Protocol(_)));
    }

    #[test]
    fn test_view_error_conversion() {
        let err: QueueError = ViewError::Storage("redis down".into()).into();
        assert!(err.to_string().contains("redis down"));
    }
}
