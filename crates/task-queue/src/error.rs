//! Queue error types.

use thiserror::Error;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors surfaced by the queue.
///
/// Only misuse is reported. Task failures are contained by the queue and
/// never show up here.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue '{0}' has been shut down")]
    ShutDown(String),

    #[error("No Tokio runtime available to run workers")]
    NoRuntime,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl QueueError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the error is permanent for this queue instance.
    pub fn is_shut_down(&self) -> bool {
        matches!(self, Self::ShutDown(_))
    }
}
