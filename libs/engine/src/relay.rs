//! Global error relay.
//!
//! Terminal failures are forwarded here so an embedder can surface them in
//! one place (toasts, logs) without the engine knowing about any UI.

use std::fmt;

use tokio::sync::broadcast;
use tracing::debug;

use crate::error::FetchError;
use crate::options::ErrorHooks;
use crate::state::Timestamp;

/// Which kind of operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        })
    }
}

/// Opaque caller-context metadata, used for diagnostics only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Marker(Option<String>);

impl Marker {
    /// No caller context.
    pub fn none() -> Self {
        Self(None)
    }

    /// A labelled caller context.
    pub fn new(label: impl Into<String>) -> Self {
        Self(Some(label.into()))
    }

    pub fn label(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_deref().unwrap_or("-"))
    }
}

/// A terminal failure, as reported to hooks and the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub kind: OperationKind,
    pub key: String,
    pub marker: Marker,
    pub error: FetchError,
    pub at: Timestamp,
}

/// Broadcast channel of [`ErrorRecord`]s.
#[derive(Debug, Clone)]
pub struct ErrorRelay {
    tx: broadcast::Sender<ErrorRecord>,
}

impl ErrorRelay {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future records.
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorRecord> {
        self.tx.subscribe()
    }

    /// Runs the per-key callback, then forwards to the relay unless the
    /// suppression predicate says otherwise.
    pub(crate) fn report(&self, hooks: &ErrorHooks, record: ErrorRecord) {
        if let Some(on_error) = &hooks.on_error {
            on_error(&record);
        }

        let suppressed = hooks
            .should_suppress_error_relay
            .as_ref()
            .is_some_and(|suppress| suppress(&record));
        if suppressed {
            debug!(kind = %record.kind, key = %record.key, "Error relay suppressed");
            return;
        }

        // No subscribers is fine
        let _ = self.tx.send(record);
    }
}
