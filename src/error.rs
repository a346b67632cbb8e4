//! Error types for syncflight.

use std::sync::Arc;

use thiserror::Error;

/// Syncflight error type.
///
/// `Clone` so a single outcome can be delivered to every waiter of a
/// broadcast without re-running the operation that produced it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A lane call was made from inside an active Mutate body of the same coordinator.
    #[error("already in mutate")]
    AlreadyInMutate,

    /// A lane call was made from inside an active Effect body of the same coordinator.
    #[error("already in effect")]
    AlreadyInEffect,

    /// `sync` or `await_idle` was called from inside the instance's own running operation.
    #[error("nested invocation")]
    NestedInvocation,

    /// The caller's work was cancelled, either by preemption or explicitly.
    #[error("cancelled")]
    Cancelled,

    /// Ordinary failure raised by a caller-supplied body.
    #[error("operation failed: {0}")]
    Operation(#[source] Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an ordinary body failure.
    pub fn operation(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Operation(Arc::from(err.into()))
    }

    /// Returns true if this error is the cancellation re-raise.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Result type alias for syncflight.
pub type Result<T> = std::result::Result<T, Error>;
