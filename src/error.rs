//! Error types for batchpool.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure raised by a task function.
///
/// This type crosses the process boundary (it is part of the worker protocol),
/// so it only carries serializable data.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum TaskError {
    /// The worker hit a memory-access fault (SIGBUS) while reading its input,
    /// typically because a memory-mapped file was truncated or unmounted.
    #[error("A worker process lost access to an input file")]
    InputInaccessible,

    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    /// Convenience constructor for a plain task failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        Self::Failed(e.to_string())
    }
}

/// Main error type for pool execution.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Interrupted")]
    Interrupted,

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Worker {worker} failed to initialize: {message}")]
    WorkerInit { worker: usize, message: String },

    #[error("Worker {worker} died: {reason}")]
    WorkerDied { worker: usize, reason: String },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Invalid pool configuration: {0}")]
    Config(String),

    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Signal error: {0}")]
    Signal(#[from] nix::errno::Errno),
}

impl PoolError {
    /// True when the batch was aborted by the user rather than by a failure.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

/// Result type alias for batchpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
