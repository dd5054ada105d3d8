use std::time::Duration;

use thiserror::Error;

use crate::id::JobId;

/// Result alias used throughout the engine.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced synchronously by pools, schedulers and pipelines.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("pool stopped")]
    PoolStopped,

    #[error("task timed out after {0:?}")]
    TaskTimeout(Duration),

    #[error("task panicked: {0}")]
    TaskPanic(String),

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("pipeline push cancelled")]
    PipelineCancelled,

    #[error("pipeline input closed")]
    PipelineClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("already started")]
    AlreadyStarted,

    #[error("shutdown already in progress")]
    ShuttingDown,

    #[error("no tokio runtime available")]
    NoRuntime,
}

impl Error {
    /// Build an [`Error::InvalidConfig`] from any message.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Outcome of a single task execution that did not succeed.
///
/// Task errors are reported asynchronously (result stream, callback, error
/// sink) and never abort sibling tasks or the owning pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task body returned an error.
    #[error("task failed: {0}")]
    Failed(String),

    /// The task exceeded its deadline and was cancelled.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// The task panicked; the worker recovered.
    #[error("task panicked: {0}")]
    Panic(String),

    /// The task was cancelled by a pool or pipeline shutdown.
    #[error("task cancelled")]
    Cancelled,
}

impl TaskError {
    /// Create a [`TaskError::Failed`].
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Timeout(_) => "timeout",
            Self::Panic(_) => "panic",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<TaskError> for Error {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Failed(msg) => Self::TaskFailed(msg),
            TaskError::Timeout(limit) => Self::TaskTimeout(limit),
            TaskError::Panic(msg) => Self::TaskPanic(msg),
            TaskError::Cancelled => Self::Cancelled,
        }
    }
}
