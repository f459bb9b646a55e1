//! Query actor - cached reads with single-flight fetching.
//!
//! One actor per query id:
//! - Runs at most one fetch at a time; commands queue behind it
//! - Skips resumes whose data is still fresh or whose captured revision is
//!   outdated, so N concurrent resumes cost one fetch
//! - Publishes every transition as a whole new [`QueryState`] snapshot

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use quarry_id::QueryId;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, debug_span, warn, Instrument};

use super::framework::{spawn, Actor, ActorContext, ActorHandle};
use crate::cache::{CachedActor, Lease};
use crate::error::{EngineError, FetchError};
use crate::keys::{InfiniteQueryKey, QueryChunk, QueryChunks, QueryKey};
use crate::options::QueryOptions;
use crate::relay::{ErrorRecord, ErrorRelay, Marker, OperationKind};
use crate::reply::Reply;
use crate::state::{QueryState, Revision, Revisioned, Timestamp};

// =============================================================================
// Messages
// =============================================================================

/// Replaces the current reply.
pub type QueryUpdater<T> = Box<dyn FnOnce(&Reply<T>) -> Reply<T> + Send>;

/// Commands handled by [`QueryActor`].
pub(crate) enum QueryCommand<T> {
    /// Fetch if the data needs it and `revision` is still current.
    Resume { revision: Option<Revision> },

    /// Forced refetch. Dropped in strict mode when `revision` is outdated.
    Fetch { revision: Option<Revision> },

    /// Mark stale; refetch if observed.
    Invalidate,

    /// Append the next page. Dropped when `revision` is outdated.
    LoadMore { revision: Option<Revision> },

    /// Replace the reply directly.
    Update { updater: QueryUpdater<T> },
}

impl<T> fmt::Debug for QueryCommand<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resume { revision } => f.debug_struct("Resume").field("revision", revision).finish(),
            Self::Fetch { revision } => f.debug_struct("Fetch").field("revision", revision).finish(),
            Self::Invalidate => f.write_str("Invalidate"),
            Self::LoadMore { revision } => {
                f.debug_struct("LoadMore").field("revision", revision).finish()
            }
            Self::Update { .. } => f.write_str("Update"),
        }
    }
}

// =============================================================================
// Drivers
// =============================================================================

/// How a query actor obtains its data.
#[async_trait]
pub(crate) trait QueryDriver<T>: Send + Sync + 'static {
    /// Full (re)fetch. `current` is the reply being replaced, if any.
    async fn fetch(&self, current: Option<&T>) -> Result<T, FetchError>;

    /// Extend `current`. `Ok(None)` means there is nothing more to load.
    async fn load_more(&self, current: &T) -> Result<Option<T>, FetchError>;

    fn content_equals(&self, old: &T, new: &T) -> bool;

    fn error_equals(&self, old: &FetchError, new: &FetchError) -> bool;
}

/// Driver for a plain [`QueryKey`].
pub(crate) struct KeyedQuery<K, R> {
    pub(crate) key: Arc<K>,
    pub(crate) receiver: Arc<R>,
}

#[async_trait]
impl<K, R> QueryDriver<K::Data> for KeyedQuery<K, R>
where
    K: QueryKey<R>,
    R: Send + Sync + 'static,
{
    async fn fetch(&self, _current: Option<&K::Data>) -> Result<K::Data, FetchError> {
        self.key.fetch(&self.receiver).await
    }

    async fn load_more(&self, _current: &K::Data) -> Result<Option<K::Data>, FetchError> {
        Ok(None)
    }

    fn content_equals(&self, old: &K::Data, new: &K::Data) -> bool {
        self.key.content_equals(old, new)
    }

    fn error_equals(&self, old: &FetchError, new: &FetchError) -> bool {
        self.key.error_equals(old, new)
    }
}

/// Driver for an [`InfiniteQueryKey`].
pub(crate) struct PagedQuery<K, R> {
    pub(crate) key: Arc<K>,
    pub(crate) receiver: Arc<R>,
}

#[async_trait]
impl<K, R> QueryDriver<QueryChunks<K::Chunk, K::Param>> for PagedQuery<K, R>
where
    K: InfiniteQueryKey<R>,
    R: Send + Sync + 'static,
{
    /// Reloads from the first page up to as many pages as were loaded.
    async fn fetch(
        &self,
        current: Option<&QueryChunks<K::Chunk, K::Param>>,
    ) -> Result<QueryChunks<K::Chunk, K::Param>, FetchError> {
        let pages = current.map_or(1, |chunks| chunks.len().max(1));
        let mut chunks = Vec::with_capacity(pages);
        let mut next = Some(self.key.initial_param());

        while let Some(param) = next.take() {
            let data = self.key.fetch(&self.receiver, param.clone()).await?;
            chunks.push(QueryChunk { data, param });
            if chunks.len() >= pages {
                break;
            }
            next = self.key.load_more_param(&chunks);
        }

        Ok(chunks)
    }

    async fn load_more(
        &self,
        current: &QueryChunks<K::Chunk, K::Param>,
    ) -> Result<Option<QueryChunks<K::Chunk, K::Param>>, FetchError> {
        let Some(param) = self.key.load_more_param(current) else {
            return Ok(None);
        };

        let data = self.key.fetch(&self.receiver, param.clone()).await?;
        let mut chunks = current.clone();
        chunks.push(QueryChunk { data, param });
        Ok(Some(chunks))
    }

    fn content_equals(
        &self,
        old: &QueryChunks<K::Chunk, K::Param>,
        new: &QueryChunks<K::Chunk, K::Param>,
    ) -> bool {
        self.key.content_equals(old, new)
    }

    fn error_equals(&self, old: &FetchError, new: &FetchError) -> bool {
        self.key.error_equals(old, new)
    }
}

// =============================================================================
// Query Actor
// =============================================================================

pub(crate) struct QueryActor<T> {
    name: String,
    id: QueryId,
    marker: Marker,
    driver: Arc<dyn QueryDriver<T>>,
    options: QueryOptions,
    state: Arc<watch::Sender<QueryState<T>>>,
    relay: ErrorRelay,
}

impl<T: Clone + Send + Sync + 'static> QueryActor<T> {
    fn current(&self) -> QueryState<T> {
        self.state.borrow().clone()
    }

    fn publish(&self, next: impl FnOnce(&QueryState<T>) -> QueryState<T>) {
        let next = {
            let current = self.state.borrow();
            next(&current)
        };
        self.state.send_replace(next);
    }

    fn is_observed(&self) -> bool {
        self.state.receiver_count() > 0
    }

    async fn resume(&mut self, revision: Option<Revision>) {
        let state = self.current();
        if !state.needs_fetch(Timestamp::now()) {
            debug!(query = %self.id, "Data is fresh, resume skipped");
            return;
        }
        if revision.is_some_and(|r| r != state.revision()) {
            debug!(query = %self.id, "Resume superseded by a newer revision");
            return;
        }
        self.run_fetch().await;
    }

    async fn run_fetch(&mut self) {
        self.publish(QueryState::fetching);

        let current = self.current().reply.into_option();
        let driver = Arc::clone(&self.driver);
        let span = debug_span!("query_fetch", query = %self.id, marker = %self.marker);
        let result = self
            .options
            .retry
            .execute(|| driver.fetch(current.as_ref()))
            .instrument(span)
            .await;

        self.settle(result.map(Some));
    }

    async fn run_load_more(&mut self) {
        let Reply::Some(current) = self.current().reply else {
            // Nothing to extend yet; load the first page
            self.run_fetch().await;
            return;
        };

        self.publish(QueryState::fetching);

        let driver = Arc::clone(&self.driver);
        let span = debug_span!("query_load_more", query = %self.id, marker = %self.marker);
        let result = self
            .options
            .retry
            .execute(|| driver.load_more(&current))
            .instrument(span)
            .await;

        if matches!(result, Ok(None)) {
            debug!(query = %self.id, "No more pages");
        }
        self.settle(result);
    }

    fn settle(&self, result: Result<Option<T>, FetchError>) {
        let now = Timestamp::now();
        match result {
            Ok(Some(data)) => {
                let driver = &self.driver;
                let stale_time = self.options.stale_time;
                self.publish(|state| {
                    state.fetch_succeeded(data, now, stale_time, |old, new| {
                        driver.content_equals(old, new)
                    })
                });
                debug!(query = %self.id, revision = %self.state.borrow().revision(), "Query fetched");
            }
            Ok(None) => self.publish(QueryState::fetch_cancelled),
            Err(FetchError::Cancelled) => {
                debug!(query = %self.id, "Query fetch cancelled");
                self.publish(QueryState::fetch_cancelled);
            }
            Err(error) => {
                warn!(query = %self.id, marker = %self.marker, error = %error, "Query fetch failed");
                let driver = &self.driver;
                self.publish(|state| {
                    state.fetch_failed(error.clone(), now, |old, new| driver.error_equals(old, new))
                });
                self.relay.report(
                    &self.options.hooks,
                    ErrorRecord {
                        kind: OperationKind::Query,
                        key: self.id.to_string(),
                        marker: self.marker.clone(),
                        error,
                        at: now,
                    },
                );
            }
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Actor for QueryActor<T> {
    type Message = QueryCommand<T>;

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &mut self,
        msg: QueryCommand<T>,
        _ctx: &mut ActorContext,
    ) -> Result<bool, EngineError> {
        match msg {
            QueryCommand::Resume { revision } => self.resume(revision).await,
            QueryCommand::Fetch { revision } => {
                let current = self.current().revision();
                if self.options.is_strict_mode && revision.is_some_and(|r| r != current) {
                    debug!(query = %self.id, "Fetch dropped, revision is outdated");
                } else {
                    self.run_fetch().await;
                }
            }
            QueryCommand::Invalidate => {
                self.publish(QueryState::invalidated);
                if self.is_observed() {
                    self.run_fetch().await;
                } else {
                    debug!(query = %self.id, "Invalidated without observers, fetch deferred");
                }
            }
            QueryCommand::LoadMore { revision } => {
                let current = self.current().revision();
                if revision.is_some_and(|r| r != current) {
                    debug!(query = %self.id, "Load more dropped, revision is outdated");
                } else {
                    self.run_load_more().await;
                }
            }
            QueryCommand::Update { updater } => {
                let stale_time = self.options.stale_time;
                self.publish(|state| {
                    state.replaced(updater(&state.reply), Timestamp::now(), stale_time)
                });
                debug!(query = %self.id, "Query reply replaced");
            }
        }

        Ok(true)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        // A fetch cut short by close must not leave observers on Fetching
        if self.state.borrow().is_fetching() {
            self.publish(QueryState::fetch_cancelled);
        }
    }
}

// =============================================================================
// References and Handles
// =============================================================================

/// The cached part of a query: its mailbox and its state channel.
pub(crate) struct QueryActorRef<T> {
    id: QueryId,
    inner: ActorHandle<QueryCommand<T>>,
    state: Arc<watch::Sender<QueryState<T>>>,
}

impl<T: Clone + Send + Sync + 'static> QueryActorRef<T> {
    pub(crate) fn spawn(
        id: QueryId,
        marker: Marker,
        driver: Arc<dyn QueryDriver<T>>,
        options: QueryOptions,
        initial: QueryState<T>,
        relay: ErrorRelay,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(initial);
        let state = Arc::new(state);
        let mailbox_size = options.mailbox_size;

        let actor = QueryActor {
            name: format!("query:{id}"),
            id: id.clone(),
            marker,
            driver,
            options,
            state: Arc::clone(&state),
            relay,
        };

        Arc::new(Self {
            id,
            inner: spawn(actor, mailbox_size),
            state,
        })
    }

    pub(crate) async fn send(&self, command: QueryCommand<T>) -> Result<(), EngineError> {
        self.inner.send(command).await
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> CachedActor for QueryActorRef<T> {
    fn kind(&self) -> OperationKind {
        OperationKind::Query
    }

    fn key(&self) -> &str {
        self.id.as_str()
    }

    fn is_observed(&self) -> bool {
        self.state.receiver_count() > 0
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.send(QueryCommand::Resume { revision: None }).await
    }

    async fn invalidate(&self) -> Result<(), EngineError> {
        self.send(QueryCommand::Invalidate).await
    }

    fn close(&self) {
        self.inner.close();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

/// Handle to a query. Holding it keeps the query cached.
pub struct QueryHandle<T> {
    actor: Arc<QueryActorRef<T>>,
    lease: Lease,
}

impl<T> Clone for QueryHandle<T> {
    fn clone(&self) -> Self {
        Self {
            actor: Arc::clone(&self.actor),
            lease: self.lease.clone(),
        }
    }
}

impl<T> fmt::Debug for QueryHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("id", &self.actor.id)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> QueryHandle<T> {
    pub(crate) fn new(actor: Arc<QueryActorRef<T>>, lease: Lease) -> Self {
        Self { actor, lease }
    }

    pub fn id(&self) -> &QueryId {
        &self.actor.id
    }

    /// Current snapshot.
    pub fn state(&self) -> QueryState<T> {
        self.actor.state.borrow().clone()
    }

    pub fn revision(&self) -> Revision {
        self.actor.state.borrow().revision()
    }

    /// Receiver that sees the current snapshot, then every later one.
    /// Holding it marks the query as observed.
    pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
        self.actor.state.subscribe()
    }

    /// Snapshot stream, starting with the current snapshot.
    pub fn watch(&self) -> WatchStream<QueryState<T>> {
        WatchStream::new(self.subscribe())
    }

    /// Fetch if no data, stale, invalidated or failed.
    pub async fn resume(&self) -> Result<(), EngineError> {
        let revision = Some(self.revision());
        self.actor.send(QueryCommand::Resume { revision }).await
    }

    /// Refetch regardless of freshness.
    pub async fn fetch(&self) -> Result<(), EngineError> {
        let revision = Some(self.revision());
        self.actor.send(QueryCommand::Fetch { revision }).await
    }

    /// Refetch, guarded by a revision the caller observed earlier.
    pub async fn fetch_with_revision(&self, revision: Revision) -> Result<(), EngineError> {
        self.actor
            .send(QueryCommand::Fetch {
                revision: Some(revision),
            })
            .await
    }

    pub async fn invalidate(&self) -> Result<(), EngineError> {
        self.actor.send(QueryCommand::Invalidate).await
    }

    /// Load the next page of a paged query. A no-op for plain queries.
    pub async fn load_more(&self) -> Result<(), EngineError> {
        let revision = Some(self.revision());
        self.actor.send(QueryCommand::LoadMore { revision }).await
    }

    /// Replace the reply with the result of `updater`.
    pub async fn update<F>(&self, updater: F) -> Result<(), EngineError>
    where
        F: FnOnce(&Reply<T>) -> Reply<T> + Send + 'static,
    {
        self.actor
            .send(QueryCommand::Update {
                updater: Box::new(updater),
            })
            .await
    }

    /// Stop the actor, cancelling any in-flight fetch.
    pub fn close(&self) {
        self.actor.inner.close();
    }

    /// Give up this handle's cache reference now, closing the actor when no
    /// other reference remains. Later calls are no-ops.
    pub(crate) fn retire(&self) {
        self.lease.retire();
    }

    pub fn is_closed(&self) -> bool {
        self.actor.inner.is_closed()
    }

    /// Wait for every command submitted so far.
    pub async fn join(&self) {
        self.actor.inner.join().await;
    }
}
