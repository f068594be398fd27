//! Scheduler error types
//!
//! Errors raised by the scheduler itself and errors a coroutine hands back
//! to it through [`Action::Error`](super::Action::Error).

use super::task::TaskId;

/// Boxed error produced by coroutine code
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The scheduler no longer accepts tasks
    #[error("Scheduler is shut down")]
    Shutdown,

    /// A worker or processor thread could not be started
    #[error("Failed to spawn thread {0}: {1}")]
    Spawn(String, std::io::Error),

    /// A continuation panicked
    #[error("Task {0} panicked: {1}")]
    Panicked(TaskId, String),

    /// The task was aborted before it finished
    #[error("Task {0} aborted")]
    Aborted(TaskId),

    /// Timeout waiting for tasks
    #[error("Timeout")]
    Timeout,

    /// Invalid scheduler configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Error raised by the task's own code
    #[error("Task error: {0}")]
    Task(BoxError),
}

impl Error {
    /// Wrap any error raised by coroutine code
    pub fn task<E: Into<BoxError>>(error: E) -> Self {
        Error::Task(error.into())
    }

    /// Try to view the wrapped task error as a concrete type
    pub fn downcast_task_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Error::Task(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, Error>;
