//! Client entry point.
//!
//! The client owns the transport receiver, the cache store and the error
//! relay, and hands out handles to cached operations.

use std::sync::Arc;

use quarry_id::KeyPattern;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::actors::mutation::{MutationActorRef, QueryEffect};
use crate::actors::query::{KeyedQuery, PagedQuery, QueryActorRef, QueryDriver};
use crate::actors::subscription::SubscriptionActorRef;
use crate::actors::{MutationHandle, QueryHandle, SubscriptionHandle};
use crate::cache::CacheStore;
use crate::combine::QuerySource;
use crate::config::ClientConfig;
use crate::error::EngineError;
use crate::keys::{InfiniteQueryKey, MutationKey, QueryChunks, QueryKey, SubscriptionKey};
use crate::network::{watch_reconnects, NetworkConnectivity};
use crate::options::{MutationOptions, QueryOptions, SubscriptionOptions};
use crate::relay::{ErrorRecord, ErrorRelay, Marker, OperationKind};
use crate::state::QueryState;

/// Data-fetching client over a transport receiver `R`.
///
/// Cloning is cheap and shares the same cache.
pub struct Client<R> {
    receiver: Arc<R>,
    config: ClientConfig,
    store: CacheStore,
    relay: ErrorRelay,
}

impl<R> Clone for Client<R> {
    fn clone(&self) -> Self {
        Self {
            receiver: Arc::clone(&self.receiver),
            config: self.config.clone(),
            store: self.store.clone(),
            relay: self.relay.clone(),
        }
    }
}

impl<R: Send + Sync + 'static> Client<R> {
    pub fn new(receiver: R, config: ClientConfig) -> Self {
        let relay = ErrorRelay::new(config.error_relay_capacity);
        Self {
            receiver: Arc::new(receiver),
            config,
            store: CacheStore::new(),
            relay,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn receiver(&self) -> &Arc<R> {
        &self.receiver
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Handle to the cached query for `key`, created on first use.
    pub fn get_query<K>(&self, key: K, marker: Marker) -> Result<QueryHandle<K::Data>, EngineError>
    where
        K: QueryKey<R>,
    {
        let options = key.configure(QueryOptions::from_config(&self.config));
        let id = key.id();
        let initial = key
            .initial_data()
            .map_or_else(QueryState::initial, QueryState::seeded);
        let driver: Arc<dyn QueryDriver<K::Data>> = Arc::new(KeyedQuery {
            key: Arc::new(key),
            receiver: Arc::clone(&self.receiver),
        });

        let gc_time = options.gc_time;
        let relay = self.relay.clone();
        let (actor, lease) =
            self.store
                .acquire(OperationKind::Query, id.as_str(), gc_time, || {
                    QueryActorRef::spawn(id.clone(), marker, driver, options, initial, relay)
                })?;

        Ok(QueryHandle::new(actor, lease))
    }

    /// Handle to the cached paged query for `key`, created on first use.
    pub fn get_infinite_query<K>(
        &self,
        key: K,
        marker: Marker,
    ) -> Result<QueryHandle<QueryChunks<K::Chunk, K::Param>>, EngineError>
    where
        K: InfiniteQueryKey<R>,
    {
        let options = key.configure(QueryOptions::from_config(&self.config));
        let id = key.id();
        let driver: Arc<dyn QueryDriver<QueryChunks<K::Chunk, K::Param>>> =
            Arc::new(PagedQuery {
                key: Arc::new(key),
                receiver: Arc::clone(&self.receiver),
            });

        let gc_time = options.gc_time;
        let relay = self.relay.clone();
        let (actor, lease) =
            self.store
                .acquire(OperationKind::Query, id.as_str(), gc_time, || {
                    QueryActorRef::spawn(
                        id.clone(),
                        marker,
                        driver,
                        options,
                        QueryState::initial(),
                        relay,
                    )
                })?;

        Ok(QueryHandle::new(actor, lease))
    }

    /// Query acquired on behalf of a combinator. The actor is the cached one
    /// for `key`; the combinator releases its reference when it closes, and
    /// the actor is closed with it unless someone else still holds it.
    pub fn auto_query<K>(
        &self,
        key: K,
        marker: Marker,
    ) -> Result<QuerySource<K::Data>, EngineError>
    where
        K: QueryKey<R>,
    {
        debug!(query = %key.id(), "Acquiring query for combinator");
        self.get_query(key, marker).map(QuerySource::Owned)
    }

    /// Handle to the cached mutation for `key`, created on first use.
    pub fn get_mutation<K>(
        &self,
        key: K,
        marker: Marker,
    ) -> Result<MutationHandle<K::Variable, K::Data>, EngineError>
    where
        K: MutationKey<R>,
    {
        let options = key.configure(MutationOptions::from_config(&self.config));
        let id = key.id();
        let key = Arc::new(key);

        let gc_time = options.gc_time;
        let receiver = Arc::clone(&self.receiver);
        let effect = QueryEffect::new(self.store.clone());
        let relay = self.relay.clone();
        let (actor, lease) =
            self.store
                .acquire(OperationKind::Mutation, id.as_str(), gc_time, || {
                    MutationActorRef::spawn(
                        id.clone(),
                        marker,
                        key,
                        receiver,
                        options,
                        effect,
                        relay,
                    )
                })?;

        Ok(MutationHandle::new(actor, lease))
    }

    /// Handle to the cached subscription for `key`, created on first use.
    pub fn get_subscription<K>(
        &self,
        key: K,
        marker: Marker,
    ) -> Result<SubscriptionHandle<K::Data>, EngineError>
    where
        K: SubscriptionKey<R>,
    {
        let options = key.configure(SubscriptionOptions::from_config(&self.config));
        let id = key.id();
        let key = Arc::new(key);

        let gc_time = options.gc_time;
        let receiver = Arc::clone(&self.receiver);
        let relay = self.relay.clone();
        let (actor, lease) =
            self.store
                .acquire(OperationKind::Subscription, id.as_str(), gc_time, || {
                    SubscriptionActorRef::spawn(id.clone(), marker, key, receiver, options, relay)
                })?;

        Ok(SubscriptionHandle::new(actor, lease))
    }

    /// Invalidate every cached query matching `pattern`.
    pub async fn invalidate_queries(&self, pattern: &KeyPattern) -> usize {
        self.store.invalidate_queries(pattern).await
    }

    /// Resume every query that currently has observers.
    pub async fn resume_observed_queries(&self) -> usize {
        self.store.resume_observed_queries().await
    }

    /// Terminal failures of every operation, unless suppressed per key.
    pub fn errors(&self) -> broadcast::Receiver<ErrorRecord> {
        self.relay.subscribe()
    }

    /// Run one GC sweep now.
    pub fn gc(&self) -> usize {
        self.store.sweep(Instant::now())
    }

    /// Sweep every `gc_interval` until shutdown.
    pub async fn run_gc(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            gc_interval_ms = self.config.gc_interval.as_millis(),
            "Starting GC loop"
        );

        let mut interval = tokio::time::interval(self.config.gc_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.gc();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("GC loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Resume observed queries after each settled reconnect, until shutdown.
    pub async fn run_network_resume<N>(&self, network: &N, shutdown: watch::Receiver<bool>)
    where
        N: NetworkConnectivity + ?Sized,
    {
        let store = self.store.clone();
        watch_reconnects(
            network.state(),
            self.config.network_resume_delay,
            move || {
                let store = store.clone();
                async move {
                    store.resume_observed_queries().await;
                }
            },
            shutdown,
        )
        .await;
    }

    /// Close every cached actor.
    pub fn close(&self) {
        self.store.close_all();
    }
}
