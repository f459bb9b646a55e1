//! Operation definitions.
//!
//! An embedder describes each remote operation by implementing one of these
//! traits. The transport receiver `R` is injected into the client once and
//! handed to every call; the engine itself never performs I/O.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use quarry_id::{MutationId, QueryId, SubscriptionId};

use crate::actors::mutation::QueryEffect;
use crate::error::FetchError;
use crate::options::{MutationOptions, QueryOptions, SubscriptionOptions};

/// A cached read.
#[async_trait]
pub trait QueryKey<R>: Send + Sync + 'static {
    type Data: Clone + Send + Sync + 'static;

    /// Identity of the query. Two keys with the same id share one actor.
    fn id(&self) -> QueryId;

    async fn fetch(&self, receiver: &R) -> Result<Self::Data, FetchError>;

    /// Refine the client defaults for this key.
    fn configure(&self, options: QueryOptions) -> QueryOptions {
        options
    }

    /// Placeholder shown until the first fetch completes. Always stale.
    fn initial_data(&self) -> Option<Self::Data> {
        None
    }

    /// When true, a refetch returning this data keeps the previous revision.
    fn content_equals(&self, _old: &Self::Data, _new: &Self::Data) -> bool {
        false
    }

    /// When true, a repeated failure keeps the previous revision.
    fn error_equals(&self, _old: &FetchError, _new: &FetchError) -> bool {
        false
    }
}

/// One page of a paged query, with the parameter it was fetched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryChunk<C, P> {
    pub data: C,
    pub param: P,
}

/// Pages loaded so far, in load order.
pub type QueryChunks<C, P> = Vec<QueryChunk<C, P>>;

/// A cached, paged read.
#[async_trait]
pub trait InfiniteQueryKey<R>: Send + Sync + 'static {
    type Chunk: Clone + Send + Sync + 'static;
    type Param: Clone + Send + Sync + 'static;

    fn id(&self) -> QueryId;

    fn initial_param(&self) -> Self::Param;

    /// Parameter of the page after `chunks`, or `None` when there are no more.
    fn load_more_param(&self, chunks: &QueryChunks<Self::Chunk, Self::Param>)
        -> Option<Self::Param>;

    async fn fetch(&self, receiver: &R, param: Self::Param) -> Result<Self::Chunk, FetchError>;

    fn configure(&self, options: QueryOptions) -> QueryOptions {
        options
    }

    fn content_equals(
        &self,
        _old: &QueryChunks<Self::Chunk, Self::Param>,
        _new: &QueryChunks<Self::Chunk, Self::Param>,
    ) -> bool {
        false
    }

    fn error_equals(&self, _old: &FetchError, _new: &FetchError) -> bool {
        false
    }
}

/// A write.
#[async_trait]
pub trait MutationKey<R>: Send + Sync + 'static {
    type Variable: Send + Sync + 'static;
    type Data: Clone + Send + Sync + 'static;

    fn id(&self) -> MutationId;

    async fn mutate(&self, receiver: &R, variable: &Self::Variable)
        -> Result<Self::Data, FetchError>;

    /// Cache-update hook: patch or invalidate affected queries.
    async fn on_query_update(
        &self,
        _effect: &QueryEffect,
        _variable: &Self::Variable,
        _data: &Self::Data,
    ) {
    }

    /// Generic side effect after a successful mutation.
    async fn on_mutate_effect(&self, _variable: &Self::Variable, _data: &Self::Data) {}

    fn configure(&self, options: MutationOptions) -> MutationOptions {
        options
    }

    fn content_equals(&self, _old: &Self::Data, _new: &Self::Data) -> bool {
        false
    }

    fn error_equals(&self, _old: &FetchError, _new: &FetchError) -> bool {
        false
    }
}

/// A streamed read.
pub trait SubscriptionKey<R>: Send + Sync + 'static {
    type Data: Clone + Send + Sync + 'static;

    fn id(&self) -> SubscriptionId;

    /// Open the stream. Called on first resume and on every reset.
    fn subscribe(&self, receiver: Arc<R>) -> BoxStream<'static, Result<Self::Data, FetchError>>;

    fn configure(&self, options: SubscriptionOptions) -> SubscriptionOptions {
        options
    }

    fn content_equals(&self, _old: &Self::Data, _new: &Self::Data) -> bool {
        false
    }

    fn error_equals(&self, _old: &FetchError, _new: &FetchError) -> bool {
        false
    }
}
