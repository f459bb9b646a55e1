//! # quarry-engine
//!
//! Client-side data-fetching engine: caching, deduplication, staleness
//! tracking, retry and garbage collection for remote reads (queries), writes
//! (mutations) and streamed reads (subscriptions). The engine performs no
//! I/O itself; every operation is an injected async function over a
//! transport receiver.
//!
//! ## Architecture
//!
//! ```text
//! Client
//! ├── CacheStore            (ref-counted actors, idle GC)
//! │   ├── QueryActor(key)        (single-flight fetch, paging)
//! │   ├── MutationActor(key)     (serialized writes, cache effects)
//! │   └── SubscriptionActor(key) (stream with reset)
//! ├── ErrorRelay            (broadcast of terminal failures)
//! └── network bridge        (resume observed queries on reconnect)
//! ```
//!
//! Each actor is the single writer of a `watch` channel holding its latest
//! state snapshot. Commands for one key run one at a time; keys are
//! independent of each other.
//!
//! ## Modules
//!
//! - `actors`: actor framework and the three operation actors
//! - `cache`: cache store, leases and GC sweep
//! - `combine`: derived queries over several constituents
//! - `keys`: traits an embedder implements to describe operations
//! - `retry`: exponential backoff executor
//! - `state`: immutable state snapshots and revisions

pub mod actors;
pub mod cache;
pub mod client;
pub mod combine;
pub mod config;
pub mod error;
pub mod keys;
pub mod network;
pub mod options;
pub mod relay;
pub mod reply;
pub mod retry;
pub mod state;

pub use actors::{MutateResult, MutationHandle, QueryEffect, QueryHandle, SubscriptionHandle};
pub use cache::{CacheStore, Lease};
pub use client::Client;
pub use combine::{
    combine2, combine3, combine_all, CombineOptions, CombinedQuery, ErrorTiebreak, QuerySource,
};
pub use config::ClientConfig;
pub use error::{EngineError, FetchError};
pub use keys::{
    InfiniteQueryKey, MutationKey, QueryChunk, QueryChunks, QueryKey, SubscriptionKey,
};
pub use network::{
    watch_reconnects, ManualConnectivity, NetworkConnectivity, NetworkState, NetworkStatus,
    ReconnectDetector,
};
pub use options::{ErrorHooks, MutationOptions, QueryOptions, SubscriptionOptions};
pub use relay::{ErrorRecord, ErrorRelay, Marker, OperationKind};
pub use reply::Reply;
pub use retry::RetryPolicy;
pub use state::{
    FetchStatus, MutationState, MutationStatus, QueryState, Revision, Revisioned, Status,
    SubscriptionState, Timestamp,
};

pub use quarry_id::{KeyError, KeyPattern, MutationId, QueryId, SubscriptionId};
