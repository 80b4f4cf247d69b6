//! Dispatcher and tick error types.

use thiserror::Error;

/// Error returned by a single element's tick.
///
/// Tick errors never leave the worker thread: they are logged at the element
/// granularity and the round carries on.
#[derive(Debug, Error)]
pub enum TickError {
    /// The element reported a failure of its own.
    #[error("tick failed: {reason}")]
    Failed {
        /// Human readable cause.
        reason: String,
    },

    /// Any other error raised while ticking.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl TickError {
    /// Create a [`TickError::Failed`] from a reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Dispatcher error type.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A dispatcher needs at least one worker thread.
    #[error("tick dispatcher requires at least one thread")]
    NoThreads,

    /// The operating system refused to spawn a worker thread.
    #[error("failed to spawn tick thread {index}: {source}")]
    Spawn {
        /// Index of the worker that could not be spawned.
        index: usize,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The dispatcher was shut down; no further rounds can run.
    #[error("tick dispatcher has been shut down")]
    ShutDown,

    /// A worker thread terminated by panicking.
    #[error("tick thread {index} panicked")]
    WorkerPanicked {
        /// Index of the worker that panicked.
        index: usize,
    },
}

/// Result type for dispatcher operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
