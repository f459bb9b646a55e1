//! Error types for the engine.
//!
//! Two layers:
//! - [`FetchError`] is what an injected fetch/mutate/stream function produces.
//!   It is stored inside state snapshots, so it is `Clone + PartialEq`.
//! - [`EngineError`] is what engine calls return to their direct caller.

use quarry_id::KeyError;
use thiserror::Error;

/// Error produced by an operation (fetch, mutate, or stream item).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The operation was cancelled. Never retried, never recorded as data.
    #[error("operation cancelled")]
    Cancelled,

    /// Transient error that should be retried.
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried.
    #[error("permanent error: {0}")]
    Permanent(String),
}

impl FetchError {
    /// Shorthand for a transient error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Shorthand for a permanent error.
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Returns true if this is a cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if the retry policy may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<anyhow::Error> for FetchError {
    fn from(err: anyhow::Error) -> Self {
        Self::Transient(format!("{err:#}"))
    }
}

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Actor mailbox is full.
    #[error("mailbox full")]
    MailboxFull,

    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,

    /// The command was cancelled before it produced a result.
    #[error("operation cancelled")]
    Cancelled,

    /// A key is already cached with a different value type.
    #[error("key '{key}' is already bound to a different operation type")]
    TypeMismatch { key: String },

    /// Invalid key or pattern.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The operation itself failed.
    #[error("operation failed: {0}")]
    Operation(FetchError),
}

impl EngineError {
    /// Returns true if the caller observed a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<FetchError> for EngineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => Self::Cancelled,
            other => Self::Operation(other),
        }
    }
}
