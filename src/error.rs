//! Error types for tasksched
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur while driving the scheduler
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Caller-supplied task id was empty
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Caller-supplied task id was already used by this scheduler
    #[error("Duplicate task id: {0}")]
    DuplicateId(String),

    /// Enqueue attempted after shutdown began
    #[error("Scheduler is shut down")]
    ShutDown,

    /// Scheduler constructed outside of a Tokio runtime
    #[error("No Tokio runtime available: {0}")]
    NoRuntime(String),

    /// Configuration rejected by validation
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;
