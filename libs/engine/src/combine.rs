//! Query combinators.
//!
//! A [`CombinedQuery`] derives one query state from several constituent
//! queries and recomputes it whenever any of them changes:
//!
//! - status: Pending if any is Pending, else Failure if any failed, else Success
//! - reply: the transform of all replies, only once every reply is present
//! - error: picked by [`ErrorTiebreak`]
//! - stamps: the latest of the constituents' (`stale_at`: the earliest)
//! - fetching / invalidated: if any constituent is

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::stream::{select_all, BoxStream, StreamExt};
use quarry_id::CombinedQueryId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::actors::QueryHandle;
use crate::error::{EngineError, FetchError};
use crate::reply::Reply;
use crate::state::{FetchStatus, QueryState, Revision, Revisioned, Status, Timestamp};

/// Which constituent error a combined query reports when several failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorTiebreak {
    /// The first failed constituent in argument order.
    #[default]
    FirstByArgumentOrder,
    /// The error with the latest `error_updated_at`.
    MostRecent,
}

#[derive(Debug, Clone, Default)]
pub struct CombineOptions {
    pub error_tiebreak: ErrorTiebreak,
}

/// A constituent query.
pub enum QuerySource<T> {
    /// Held elsewhere too; never closed by the combinator.
    Shared(QueryHandle<T>),
    /// Acquired for the combinator. Its reference is released when the
    /// combinator closes, closing the actor if nothing else holds it.
    Owned(QueryHandle<T>),
}

impl<T> QuerySource<T> {
    pub fn handle(&self) -> &QueryHandle<T> {
        match self {
            Self::Shared(handle) | Self::Owned(handle) => handle,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }
}

impl<T> From<QueryHandle<T>> for QuerySource<T> {
    fn from(handle: QueryHandle<T>) -> Self {
        Self::Shared(handle)
    }
}

impl<T> fmt::Debug for QuerySource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared(handle) => f.debug_tuple("Shared").field(handle).finish(),
            Self::Owned(handle) => f.debug_tuple("Owned").field(handle).finish(),
        }
    }
}

// =============================================================================
// Constituents
// =============================================================================

/// The reply-independent part of a constituent's state.
#[derive(Debug, Clone)]
struct Summary {
    status: Status,
    fetch_status: FetchStatus,
    is_invalidated: bool,
    error: Option<FetchError>,
    reply_updated_at: Timestamp,
    error_updated_at: Timestamp,
    stale_at: Timestamp,
    fetched_at: Timestamp,
}

impl Summary {
    fn of<T>(state: &QueryState<T>) -> Self {
        Self {
            status: state.status,
            fetch_status: state.fetch_status,
            is_invalidated: state.is_invalidated,
            error: state.error.clone(),
            reply_updated_at: state.reply_updated_at,
            error_updated_at: state.error_updated_at,
            stale_at: state.stale_at,
            fetched_at: state.fetched_at,
        }
    }
}

#[async_trait]
trait Constituent: Send + Sync + 'static {
    fn changes(&self) -> BoxStream<'static, ()>;

    async fn resume(&self) -> Result<(), EngineError>;

    async fn invalidate(&self) -> Result<(), EngineError>;

    async fn join(&self);

    fn release_if_owned(&self);
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Constituent for QuerySource<T> {
    fn changes(&self) -> BoxStream<'static, ()> {
        WatchStream::from_changes(self.handle().subscribe())
            .map(|_| ())
            .boxed()
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.handle().resume().await
    }

    async fn invalidate(&self) -> Result<(), EngineError> {
        self.handle().invalidate().await
    }

    async fn join(&self) {
        self.handle().join().await;
    }

    fn release_if_owned(&self) {
        if self.is_owned() {
            self.handle().retire();
        }
    }
}

/// Takes one snapshot per constituent and returns their summaries with the
/// combined reply, `None` unless every reply is present.
type Snapshot<R> = Box<dyn Fn() -> (Vec<Summary>, Reply<R>) + Send + Sync>;

fn merge<R>(summaries: &[Summary], reply: Reply<R>, tiebreak: ErrorTiebreak) -> QueryState<R> {
    let status = if summaries.iter().any(|s| s.status == Status::Pending) {
        Status::Pending
    } else if summaries.iter().any(|s| s.status == Status::Failure) {
        Status::Failure
    } else {
        Status::Success
    };

    let failed = summaries.iter().filter(|s| s.error.is_some());
    let error = match tiebreak {
        ErrorTiebreak::FirstByArgumentOrder => failed.clone().next(),
        // Ties keep argument order
        ErrorTiebreak::MostRecent => failed.clone().fold(None, |best: Option<&Summary>, s| {
            match best {
                Some(b) if b.error_updated_at >= s.error_updated_at => Some(b),
                _ => Some(s),
            }
        }),
    }
    .and_then(|s| s.error.clone());

    let latest = |f: fn(&Summary) -> Timestamp| {
        summaries.iter().map(f).max().unwrap_or(Timestamp::ZERO)
    };

    QueryState {
        reply,
        reply_updated_at: latest(|s| s.reply_updated_at),
        error,
        error_updated_at: latest(|s| s.error_updated_at),
        stale_at: summaries
            .iter()
            .map(|s| s.stale_at)
            .min()
            .unwrap_or(Timestamp::ZERO),
        fetched_at: latest(|s| s.fetched_at),
        status,
        fetch_status: if summaries.iter().any(|s| s.fetch_status == FetchStatus::Fetching) {
            FetchStatus::Fetching
        } else {
            FetchStatus::Idle
        },
        is_invalidated: summaries.iter().any(|s| s.is_invalidated),
    }
}

// =============================================================================
// Combined Query
// =============================================================================

/// A query whose state is derived from other queries.
///
/// Not cached. Dropping it stops recomputation and releases owned constituents.
pub struct CombinedQuery<R> {
    id: CombinedQueryId,
    constituents: Arc<Vec<Arc<dyn Constituent>>>,
    state: Arc<watch::Sender<QueryState<R>>>,
    task: JoinHandle<()>,
}

impl<R: Clone + Send + Sync + 'static> CombinedQuery<R> {
    fn new(
        options: CombineOptions,
        constituents: Vec<Arc<dyn Constituent>>,
        snapshot: Snapshot<R>,
    ) -> Self {
        let id = CombinedQueryId::new();
        let constituents = Arc::new(constituents);
        let tiebreak = options.error_tiebreak;

        let compute = move || {
            let (summaries, reply) = snapshot();
            merge(&summaries, reply, tiebreak)
        };

        // Subscribe before the first computation so no change is missed
        let mut changes = select_all(constituents.iter().map(|c| c.changes()));

        let (state, _) = watch::channel(compute());
        let state = Arc::new(state);

        let task = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                while changes.next().await.is_some() {
                    state.send_replace(compute());
                }
                debug!(combined = %id, "Combined query watcher stopped");
            })
        };

        debug!(combined = %id, constituents = constituents.len(), "Combined query created");

        Self {
            id,
            constituents,
            state,
            task,
        }
    }

    pub fn id(&self) -> CombinedQueryId {
        self.id
    }

    pub fn state(&self) -> QueryState<R> {
        self.state.borrow().clone()
    }

    pub fn revision(&self) -> Revision {
        self.state.borrow().revision()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryState<R>> {
        self.state.subscribe()
    }

    pub fn watch(&self) -> WatchStream<QueryState<R>> {
        WatchStream::new(self.subscribe())
    }

    /// Resume every constituent concurrently. Returns the first error.
    pub async fn resume(&self) -> Result<(), EngineError> {
        join_all(self.constituents.iter().map(|c| c.resume()))
            .await
            .into_iter()
            .collect()
    }

    /// Invalidate every constituent concurrently. Returns the first error.
    pub async fn invalidate(&self) -> Result<(), EngineError> {
        join_all(self.constituents.iter().map(|c| c.invalidate()))
            .await
            .into_iter()
            .collect()
    }

    /// Wait for every constituent's submitted commands.
    pub async fn join(&self) {
        join_all(self.constituents.iter().map(|c| c.join())).await;
    }

    /// Stop recomputing and release owned constituents.
    pub fn close(&self) {
        self.task.abort();
        for constituent in self.constituents.iter() {
            constituent.release_if_owned();
        }
    }
}

impl<R> Drop for CombinedQuery<R> {
    fn drop(&mut self) {
        self.task.abort();
        for constituent in self.constituents.iter() {
            constituent.release_if_owned();
        }
    }
}

impl<R> fmt::Debug for CombinedQuery<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombinedQuery")
            .field("id", &self.id)
            .field("constituents", &self.constituents.len())
            .finish()
    }
}

// =============================================================================
// Constructors
// =============================================================================

/// Combine two queries.
pub fn combine2<A, B, R, F>(
    options: CombineOptions,
    a: impl Into<QuerySource<A>>,
    b: impl Into<QuerySource<B>>,
    transform: F,
) -> CombinedQuery<R>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    F: Fn(&A, &B) -> R + Send + Sync + 'static,
{
    let a: Arc<QuerySource<A>> = Arc::new(a.into());
    let b: Arc<QuerySource<B>> = Arc::new(b.into());

    let snapshot: Snapshot<R> = {
        let (a, b) = (Arc::clone(&a), Arc::clone(&b));
        Box::new(move || {
            let (a, b) = (a.handle().state(), b.handle().state());
            let summaries = vec![Summary::of(&a), Summary::of(&b)];
            let reply = match (a.reply, b.reply) {
                (Reply::Some(a), Reply::Some(b)) => Reply::Some(transform(&a, &b)),
                _ => Reply::None,
            };
            (summaries, reply)
        })
    };

    let (a, b): (Arc<dyn Constituent>, Arc<dyn Constituent>) = (a, b);
    CombinedQuery::new(options, vec![a, b], snapshot)
}

/// Combine three queries.
pub fn combine3<A, B, C, R, F>(
    options: CombineOptions,
    a: impl Into<QuerySource<A>>,
    b: impl Into<QuerySource<B>>,
    c: impl Into<QuerySource<C>>,
    transform: F,
) -> CombinedQuery<R>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    F: Fn(&A, &B, &C) -> R + Send + Sync + 'static,
{
    let a: Arc<QuerySource<A>> = Arc::new(a.into());
    let b: Arc<QuerySource<B>> = Arc::new(b.into());
    let c: Arc<QuerySource<C>> = Arc::new(c.into());

    let snapshot: Snapshot<R> = {
        let (a, b, c) = (Arc::clone(&a), Arc::clone(&b), Arc::clone(&c));
        Box::new(move || {
            let (a, b, c) = (a.handle().state(), b.handle().state(), c.handle().state());
            let summaries = vec![Summary::of(&a), Summary::of(&b), Summary::of(&c)];
            let reply = match (a.reply, b.reply, c.reply) {
                (Reply::Some(a), Reply::Some(b), Reply::Some(c)) => {
                    Reply::Some(transform(&a, &b, &c))
                }
                _ => Reply::None,
            };
            (summaries, reply)
        })
    };

    let (a, b, c): (Arc<dyn Constituent>, Arc<dyn Constituent>, Arc<dyn Constituent>) = (a, b, c);
    CombinedQuery::new(options, vec![a, b, c], snapshot)
}

/// Combine any number of queries of the same type.
pub fn combine_all<T, R, F>(
    options: CombineOptions,
    sources: Vec<QuerySource<T>>,
    transform: F,
) -> CombinedQuery<R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    F: Fn(&[T]) -> R + Send + Sync + 'static,
{
    let sources: Vec<Arc<QuerySource<T>>> = sources.into_iter().map(Arc::new).collect();

    let snapshot: Snapshot<R> = {
        let sources = sources.clone();
        Box::new(move || {
            let states: Vec<QueryState<T>> = sources.iter().map(|s| s.handle().state()).collect();
            let summaries = states.iter().map(Summary::of).collect();
            let replies: Option<Vec<T>> = states
                .into_iter()
                .map(|state| state.reply.into_option())
                .collect();
            let reply = match replies {
                Some(values) => Reply::Some(transform(&values)),
                None => Reply::None,
            };
            (summaries, reply)
        })
    };

    let constituents = sources
        .into_iter()
        .map(|s| s as Arc<dyn Constituent>)
        .collect();
    CombinedQuery::new(options, constituents, snapshot)
}
