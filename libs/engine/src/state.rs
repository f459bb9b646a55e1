//! Immutable state snapshots for queries, mutations and subscriptions.
//!
//! Every transition is a pure function `&Self -> Self`. Actors build the next
//! snapshot from the current one and publish it whole; a published snapshot
//! is never modified afterwards.
//!
//! ## Revisions
//!
//! A [`Revision`] fingerprints `(reply_updated_at, error_updated_at)`. Stamps
//! only move forward within one actor (see [`Timestamp::advance`]), so an
//! observer never sees a revision built from older stamps after a newer one.

use std::fmt;
use std::time::Duration;

use crate::error::FetchError;
use crate::reply::Reply;

// =============================================================================
// Timestamps and Revisions
// =============================================================================

/// Wall-clock time in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The epoch; used for "never".
    pub const ZERO: Self = Self(0);

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis().max(0) as u64)
    }

    /// Creates a timestamp from raw milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the raw milliseconds.
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// The stamp to record when this field changes at `now`.
    ///
    /// Strictly greater than `self`, even when the wall clock has not moved
    /// or went backwards.
    pub fn advance(self, now: Timestamp) -> Timestamp {
        if now > self {
            now
        } else {
            Self(self.0 + 1)
        }
    }

    /// Adds a duration, saturating at `u64::MAX`.
    pub fn saturating_add(self, duration: Duration) -> Timestamp {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(millis))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque fingerprint of a snapshot's reply and error stamps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision(String);

impl Revision {
    /// Builds the revision for a pair of stamps.
    pub fn new(reply_updated_at: Timestamp, error_updated_at: Timestamp) -> Self {
        Self(format!("r{reply_updated_at}-{error_updated_at}"))
    }

    /// Get the revision string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared shape of every operation state.
pub trait Revisioned {
    /// When the reply last changed.
    fn reply_updated_at(&self) -> Timestamp;

    /// When the error last changed.
    fn error_updated_at(&self) -> Timestamp;

    /// Derived fingerprint; equal revisions are causally equivalent.
    fn revision(&self) -> Revision {
        Revision::new(self.reply_updated_at(), self.error_updated_at())
    }
}

// =============================================================================
// Status Enums
// =============================================================================

/// Terminal-result status shared by queries and subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// No terminal result yet.
    Pending,
    /// Last terminal result was a reply.
    Success,
    /// Last terminal result was an error.
    Failure,
}

/// Whether a query is currently running its fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchStatus {
    Idle,
    Fetching,
}

/// Mutation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationStatus {
    /// Never mutated, or reset.
    Idle,
    /// A mutate call is running.
    Pending,
    Success,
    Failure,
}

// =============================================================================
// Query State
// =============================================================================

/// Snapshot of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    pub reply: Reply<T>,
    pub reply_updated_at: Timestamp,
    pub error: Option<FetchError>,
    pub error_updated_at: Timestamp,
    /// Data is stale at or after this instant.
    pub stale_at: Timestamp,
    /// Last time a fetch completed successfully, even if the content was unchanged.
    pub fetched_at: Timestamp,
    pub status: Status,
    pub fetch_status: FetchStatus,
    pub is_invalidated: bool,
}

impl<T> Revisioned for QueryState<T> {
    fn reply_updated_at(&self) -> Timestamp {
        self.reply_updated_at
    }

    fn error_updated_at(&self) -> Timestamp {
        self.error_updated_at
    }
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self::initial()
    }
}

impl<T> QueryState<T> {
    /// State of a query that has never run.
    pub fn initial() -> Self {
        Self {
            reply: Reply::None,
            reply_updated_at: Timestamp::ZERO,
            error: None,
            error_updated_at: Timestamp::ZERO,
            stale_at: Timestamp::ZERO,
            fetched_at: Timestamp::ZERO,
            status: Status::Pending,
            fetch_status: FetchStatus::Idle,
            is_invalidated: false,
        }
    }

    /// State seeded with placeholder data. The data is already stale, so the
    /// first resume still fetches.
    pub fn seeded(data: T) -> Self {
        Self {
            reply: Reply::Some(data),
            status: Status::Success,
            ..Self::initial()
        }
    }

    /// Returns true if the data is stale at `now`.
    pub fn is_stale(&self, now: Timestamp) -> bool {
        self.is_invalidated || now >= self.stale_at
    }

    /// Returns true if a resume at `now` should fetch.
    pub fn needs_fetch(&self, now: Timestamp) -> bool {
        self.reply.is_none() || self.status == Status::Failure || self.is_stale(now)
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }
}

impl<T: Clone> QueryState<T> {
    pub(crate) fn fetching(&self) -> Self {
        Self {
            fetch_status: FetchStatus::Fetching,
            ..self.clone()
        }
    }

    pub(crate) fn fetch_cancelled(&self) -> Self {
        Self {
            fetch_status: FetchStatus::Idle,
            ..self.clone()
        }
    }

    pub(crate) fn invalidated(&self) -> Self {
        Self {
            is_invalidated: true,
            ..self.clone()
        }
    }

    /// Applies a successful fetch. Content-equal data keeps the old reply and
    /// its stamp.
    pub(crate) fn fetch_succeeded(
        &self,
        data: T,
        now: Timestamp,
        stale_time: Duration,
        same_content: impl FnOnce(&T, &T) -> bool,
    ) -> Self {
        let (reply, reply_updated_at) = match self.reply.get() {
            Some(current) if same_content(current, &data) => {
                (self.reply.clone(), self.reply_updated_at)
            }
            _ => (Reply::Some(data), self.reply_updated_at.advance(now)),
        };

        Self {
            reply,
            reply_updated_at,
            error: None,
            error_updated_at: self.cleared_error_stamp(now),
            stale_at: now.saturating_add(stale_time),
            fetched_at: self.fetched_at.advance(now),
            status: Status::Success,
            fetch_status: FetchStatus::Idle,
            is_invalidated: false,
        }
    }

    /// Applies a terminal fetch failure. The reply is kept.
    pub(crate) fn fetch_failed(
        &self,
        error: FetchError,
        now: Timestamp,
        same_error: impl FnOnce(&FetchError, &FetchError) -> bool,
    ) -> Self {
        let error_updated_at = match &self.error {
            Some(current) if same_error(current, &error) => self.error_updated_at,
            _ => self.error_updated_at.advance(now),
        };

        Self {
            error: Some(error),
            error_updated_at,
            status: Status::Failure,
            fetch_status: FetchStatus::Idle,
            ..self.clone()
        }
    }

    /// Replaces the reply directly, as a cache-update hook does.
    pub(crate) fn replaced(&self, reply: Reply<T>, now: Timestamp, stale_time: Duration) -> Self {
        let status = if reply.is_some() {
            Status::Success
        } else {
            Status::Pending
        };

        Self {
            reply,
            reply_updated_at: self.reply_updated_at.advance(now),
            error: None,
            error_updated_at: self.cleared_error_stamp(now),
            stale_at: now.saturating_add(stale_time),
            status,
            is_invalidated: false,
            ..self.clone()
        }
    }

    fn cleared_error_stamp(&self, now: Timestamp) -> Timestamp {
        if self.error.is_some() {
            self.error_updated_at.advance(now)
        } else {
            self.error_updated_at
        }
    }
}

// =============================================================================
// Mutation State
// =============================================================================

/// Snapshot of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationState<S> {
    pub reply: Reply<S>,
    pub reply_updated_at: Timestamp,
    pub error: Option<FetchError>,
    pub error_updated_at: Timestamp,
    pub status: MutationStatus,
    /// Number of successful mutations since creation or the last reset.
    pub mutated_count: u32,
    pub submitted_at: Timestamp,
}

impl<S> Revisioned for MutationState<S> {
    fn reply_updated_at(&self) -> Timestamp {
        self.reply_updated_at
    }

    fn error_updated_at(&self) -> Timestamp {
        self.error_updated_at
    }
}

impl<S> Default for MutationState<S> {
    fn default() -> Self {
        Self::initial()
    }
}

impl<S> MutationState<S> {
    pub fn initial() -> Self {
        Self {
            reply: Reply::None,
            reply_updated_at: Timestamp::ZERO,
            error: None,
            error_updated_at: Timestamp::ZERO,
            status: MutationStatus::Idle,
            mutated_count: 0,
            submitted_at: Timestamp::ZERO,
        }
    }

    /// Returns true once a mutation has completed successfully.
    pub fn is_mutated(&self) -> bool {
        self.mutated_count > 0
    }
}

impl<S: Clone> MutationState<S> {
    pub(crate) fn pending(&self, now: Timestamp) -> Self {
        Self {
            status: MutationStatus::Pending,
            submitted_at: self.submitted_at.advance(now),
            ..self.clone()
        }
    }

    pub(crate) fn mutate_succeeded(
        &self,
        data: S,
        now: Timestamp,
        same_content: impl FnOnce(&S, &S) -> bool,
    ) -> Self {
        let (reply, reply_updated_at) = match self.reply.get() {
            Some(current) if same_content(current, &data) => {
                (self.reply.clone(), self.reply_updated_at)
            }
            _ => (Reply::Some(data), self.reply_updated_at.advance(now)),
        };
        let error_updated_at = if self.error.is_some() {
            self.error_updated_at.advance(now)
        } else {
            self.error_updated_at
        };

        Self {
            reply,
            reply_updated_at,
            error: None,
            error_updated_at,
            status: MutationStatus::Success,
            mutated_count: self.mutated_count.saturating_add(1),
            submitted_at: self.submitted_at,
        }
    }

    pub(crate) fn mutate_failed(
        &self,
        error: FetchError,
        now: Timestamp,
        same_error: impl FnOnce(&FetchError, &FetchError) -> bool,
    ) -> Self {
        let error_updated_at = match &self.error {
            Some(current) if same_error(current, &error) => self.error_updated_at,
            _ => self.error_updated_at.advance(now),
        };

        Self {
            error: Some(error),
            error_updated_at,
            status: MutationStatus::Failure,
            ..self.clone()
        }
    }

    /// Back to idle. Stamps still move forward so revisions stay monotonic.
    pub(crate) fn reset(&self, now: Timestamp) -> Self {
        Self {
            reply_updated_at: if self.reply.is_some() {
                self.reply_updated_at.advance(now)
            } else {
                self.reply_updated_at
            },
            error_updated_at: if self.error.is_some() {
                self.error_updated_at.advance(now)
            } else {
                self.error_updated_at
            },
            submitted_at: self.submitted_at,
            ..Self::initial()
        }
    }
}

// =============================================================================
// Subscription State
// =============================================================================

/// Snapshot of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionState<T> {
    pub reply: Reply<T>,
    pub reply_updated_at: Timestamp,
    pub error: Option<FetchError>,
    pub error_updated_at: Timestamp,
    pub status: Status,
    /// Last time the stream was re-established by a reset.
    pub restarted_at: Timestamp,
    pub is_streaming: bool,
}

impl<T> Revisioned for SubscriptionState<T> {
    fn reply_updated_at(&self) -> Timestamp {
        self.reply_updated_at
    }

    fn error_updated_at(&self) -> Timestamp {
        self.error_updated_at
    }
}

impl<T> Default for SubscriptionState<T> {
    fn default() -> Self {
        Self::initial()
    }
}

impl<T> SubscriptionState<T> {
    pub fn initial() -> Self {
        Self {
            reply: Reply::None,
            reply_updated_at: Timestamp::ZERO,
            error: None,
            error_updated_at: Timestamp::ZERO,
            status: Status::Pending,
            restarted_at: Timestamp::ZERO,
            is_streaming: false,
        }
    }
}

impl<T: Clone> SubscriptionState<T> {
    pub(crate) fn streaming(&self, is_streaming: bool) -> Self {
        Self {
            is_streaming,
            ..self.clone()
        }
    }

    pub(crate) fn received(
        &self,
        data: T,
        now: Timestamp,
        same_content: impl FnOnce(&T, &T) -> bool,
    ) -> Self {
        let (reply, reply_updated_at) = match self.reply.get() {
            Some(current) if same_content(current, &data) => {
                (self.reply.clone(), self.reply_updated_at)
            }
            _ => (Reply::Some(data), self.reply_updated_at.advance(now)),
        };
        let error_updated_at = if self.error.is_some() {
            self.error_updated_at.advance(now)
        } else {
            self.error_updated_at
        };

        Self {
            reply,
            reply_updated_at,
            error: None,
            error_updated_at,
            status: Status::Success,
            ..self.clone()
        }
    }

    pub(crate) fn failed(
        &self,
        error: FetchError,
        now: Timestamp,
        same_error: impl FnOnce(&FetchError, &FetchError) -> bool,
    ) -> Self {
        let error_updated_at = match &self.error {
            Some(current) if same_error(current, &error) => self.error_updated_at,
            _ => self.error_updated_at.advance(now),
        };

        Self {
            error: Some(error),
            error_updated_at,
            status: Status::Failure,
            is_streaming: false,
            ..self.clone()
        }
    }

    /// Cleared state for a re-established stream.
    pub(crate) fn restarted(&self, now: Timestamp) -> Self {
        Self {
            reply_updated_at: if self.reply.is_some() {
                self.reply_updated_at.advance(now)
            } else {
                self.reply_updated_at
            },
            error_updated_at: if self.error.is_some() {
                self.error_updated_at.advance(now)
            } else {
                self.error_updated_at
            },
            restarted_at: self.restarted_at.advance(now),
            ..Self::initial()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const T1: Timestamp = Timestamp::from_millis(1_000);
    const T2: Timestamp = Timestamp::from_millis(2_000);

    fn never_equal<V>(_: &V, _: &V) -> bool {
        false
    }

    #[test]
    fn test_advance_is_strictly_increasing() {
        assert_eq!(T1.advance(T2), T2);
        assert_eq!(T2.advance(T1), Timestamp::from_millis(2_001));
        assert_eq!(T1.advance(T1), Timestamp::from_millis(1_001));
    }

    #[test]
    fn test_query_status_follows_results() {
        let state = QueryState::<i32>::initial();
        assert_eq!(state.status, Status::Pending);

        let ok = state.fetching().fetch_succeeded(1, T1, Duration::ZERO, never_equal);
        assert_eq!(ok.status, Status::Success);
        assert_eq!(ok.fetch_status, FetchStatus::Idle);

        let failed = ok.fetch_failed(FetchError::transient("x"), T2, never_equal);
        assert_eq!(failed.status, Status::Failure);
        // Failure keeps the last good reply
        assert_eq!(failed.reply, Reply::Some(1));
    }

    #[test]
    fn test_content_equal_fetch_keeps_reply_stamp() {
        let state = QueryState::<i32>::initial().fetch_succeeded(7, T1, Duration::ZERO, never_equal);
        let again = state.fetch_succeeded(7, T2, Duration::ZERO, |a, b| a == b);

        assert_eq!(again.reply_updated_at, state.reply_updated_at);
        assert_eq!(again.revision(), state.revision());
        assert!(again.fetched_at > state.fetched_at);
    }

    #[test]
    fn test_revision_ignores_fetch_status() {
        let state = QueryState::<i32>::initial().fetch_succeeded(7, T1, Duration::ZERO, never_equal);
        assert_eq!(state.fetching().revision(), state.revision());
        assert_eq!(state.invalidated().revision(), state.revision());
    }

    #[test]
    fn test_equal_error_keeps_error_stamp() {
        let state = QueryState::<i32>::initial().fetch_failed(FetchError::transient("x"), T1, never_equal);
        let again = state.fetch_failed(FetchError::transient("x"), T2, |a, b| a == b);
        assert_eq!(again.error_updated_at, state.error_updated_at);

        let different = state.fetch_failed(FetchError::transient("y"), T2, |a, b| a == b);
        assert!(different.error_updated_at > state.error_updated_at);
    }

    #[test]
    fn test_staleness() {
        let state = QueryState::<i32>::initial().fetch_succeeded(
            1,
            T1,
            Duration::from_secs(5),
            never_equal,
        );
        assert!(!state.needs_fetch(T2));
        assert!(state.needs_fetch(T1.saturating_add(Duration::from_secs(5))));
        assert!(state.invalidated().needs_fetch(T2));
    }

    #[test]
    fn test_seeded_state_is_stale() {
        let state = QueryState::seeded(3);
        assert_eq!(state.reply, Reply::Some(3));
        assert!(state.needs_fetch(T1));
    }

    #[test]
    fn test_mutation_reset_keeps_revisions_monotonic() {
        let state = MutationState::<i32>::initial()
            .pending(T1)
            .mutate_succeeded(4, T1, never_equal);
        assert!(state.is_mutated());

        let reset = state.reset(T1);
        assert_eq!(reset.status, MutationStatus::Idle);
        assert!(!reset.is_mutated());
        assert!(reset.reply.is_none());
        assert!(reset.reply_updated_at > state.reply_updated_at);
    }

    #[test]
    fn test_subscription_restart_stamps_restarted_at() {
        let state = SubscriptionState::<i32>::initial().received(1, T1, never_equal);
        let restarted = state.restarted(T2);
        assert_eq!(restarted.status, Status::Pending);
        assert_eq!(restarted.restarted_at, T2);
        assert_ne!(restarted.revision(), state.revision());
    }
}
