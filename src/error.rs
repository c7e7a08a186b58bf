//! Error types for the distributed task queue

use thiserror::Error;

/// Result type alias for task operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Comprehensive error types for the task queue system
#[derive(Error, Debug)]
pub enum TaskError {
    /// Redis connection or operation errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Task serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed task or enqueue options, rejected before reaching the store
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// A non-terminal task already holds the unique key
    #[error("Duplicate task: unique key {unique_key} is held by {task_id}")]
    DuplicateTask { unique_key: String, task_id: String },

    /// No handler is registered for the task type
    #[error("No handler registered for task type: {task_type}")]
    UnknownTaskType { task_type: String },

    /// A handler was registered twice for the same task type
    #[error("Handler already registered for task type: {task_type}")]
    DuplicateHandler { task_type: String },

    /// Task execution errors (retried with backoff)
    #[error("Task execution failed: {message}")]
    TaskExecution { message: String },

    /// Handler asked for the task not to be retried
    #[error("Task failed without retry: {message}")]
    SkipRetry { message: String },

    /// The caller no longer owns the lease on the task
    #[error("Lease expired for task: {task_id}")]
    LeaseExpired { task_id: String },

    /// The task is in a state that does not allow the requested transition
    #[error("Task {task_id} cannot leave state {state}")]
    InvalidState { task_id: String, state: String },

    /// Task retry limit exceeded
    #[error("Task retry limit exceeded: {task_id} (max retries: {max_retries})")]
    RetryLimitExceeded { task_id: String, max_retries: u32 },

    /// Task not found in queue
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// Queue operation errors
    #[error("Queue operation failed: {operation}: {reason}")]
    QueueOperation { operation: String, reason: String },

    /// Scheduler errors
    #[error("Scheduler error: {message}")]
    Scheduler { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Generic errors for wrapping other error types
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a task execution error
    pub fn task_execution<S: Into<String>>(message: S) -> Self {
        Self::TaskExecution {
            message: message.into(),
        }
    }

    /// Create an error that archives the task instead of retrying it
    pub fn skip_retry<S: Into<String>>(message: S) -> Self {
        Self::SkipRetry {
            message: message.into(),
        }
    }

    /// Create a lease expired error
    pub fn lease_expired<S: Into<String>>(task_id: S) -> Self {
        Self::LeaseExpired {
            task_id: task_id.into(),
        }
    }

    /// Create a queue operation error
    pub fn queue_operation<S: Into<String>>(operation: S, reason: S) -> Self {
        Self::QueueOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a scheduler error
    pub fn scheduler<S: Into<String>>(message: S) -> Self {
        Self::Scheduler {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Whether a failed handler run should skip the retry policy
    pub fn is_skip_retry(&self) -> bool {
        matches!(self, TaskError::SkipRetry { .. })
    }

    /// Whether the error means the worker lost its lease
    pub fn is_lease_expired(&self) -> bool {
        matches!(self, TaskError::LeaseExpired { .. })
    }

    /// Check if the error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            TaskError::Redis(e) => e.is_io_error() || e.is_connection_dropped() || e.is_timeout(),
            TaskError::Timeout { .. } => true,
            TaskError::QueueOperation { .. } => true,
            TaskError::TaskExecution { .. } => true,
            TaskError::Io(_) => true,
            TaskError::Serialization(_) => false,
            TaskError::Validation { .. } => false,
            TaskError::DuplicateTask { .. } => false,
            TaskError::UnknownTaskType { .. } => false,
            TaskError::DuplicateHandler { .. } => false,
            TaskError::SkipRetry { .. } => false,
            TaskError::LeaseExpired { .. } => false,
            TaskError::InvalidState { .. } => false,
            TaskError::TaskNotFound { .. } => false,
            TaskError::RetryLimitExceeded { .. } => false,
            TaskError::Config { .. } => false,
            TaskError::Scheduler { .. } => false,
            TaskError::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_errors_are_classified() {
        assert!(TaskError::task_execution("boom").is_recoverable());
        assert!(!TaskError::skip_retry("bad payload").is_recoverable());
        assert!(TaskError::skip_retry("bad payload").is_skip_retry());
        assert!(!TaskError::task_execution("boom").is_skip_retry());
    }

    #[test]
    fn store_trouble_is_recoverable() {
        assert!(TaskError::queue_operation("dequeue", "connection refused").is_recoverable());
        assert!(TaskError::timeout("renew_lease").is_recoverable());
        assert!(!TaskError::validation("lease out of range").is_recoverable());
        assert!(!TaskError::TaskNotFound { task_id: "abc".to_string() }.is_recoverable());
    }

    #[test]
    fn lease_errors_are_terminal_for_the_worker() {
        let err = TaskError::lease_expired("abc");
        assert!(err.is_lease_expired());
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "Lease expired for task: abc");
    }
}
