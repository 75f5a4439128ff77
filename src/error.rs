//! Error types for jetq operations.
//!
//! One enum per subsystem:
//! - `QueueError`: connection and producer failures
//! - `JobError`: missing or malformed job records
//! - `WorkerError`: worker lifecycle and handler failures

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the producer and the connection layer.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to establish a Redis connection.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// A Redis command failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a job record.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The queue was closed and no longer accepts operations.
    #[error("Queue '{0}' is not ready")]
    NotReady(String),
}

/// Errors raised when reading individual job records.
///
/// An absent record is not an error; reads return `None` for unknown
/// ids.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job {id} record is malformed: {source}")]
    Malformed {
        id: Uuid,
        #[source]
        source: serde_json::Error,
    },

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Errors raised by the worker runtime.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker initialization failed: {0}")]
    InitFailed(String),

    #[error("A handler is already registered for this worker")]
    HandlerAlreadyRegistered,

    #[error("Job timeout")]
    JobTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = QueueError::NotReady("emails".to_string());
        assert!(err.to_string().contains("emails"));
    }

    #[test]
    fn test_job_error_display() {
        let id = Uuid::new_v4();
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = JobError::Malformed { id, source };
        assert!(err.to_string().contains(&id.to_string()));
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn test_worker_error_display() {
        assert_eq!(WorkerError::JobTimeout.to_string(), "Job timeout");
        assert!(WorkerError::HandlerAlreadyRegistered
            .to_string()
            .contains("already registered"));
    }
}
