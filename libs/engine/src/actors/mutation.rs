//! Mutation actor - serialized writes with cache effects.
//!
//! One actor per mutation id. Mutate calls run one at a time in submission
//! order. A successful mutation runs two hooks: the cache-update hook, which
//! can patch or invalidate cached queries through a [`QueryEffect`], and the
//! generic effect hook.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use quarry_id::{KeyPattern, MutationId, QueryId};
use tokio::sync::{oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, debug_span, info, warn, Instrument};

use super::framework::{spawn, Actor, ActorContext, ActorHandle};
use super::query::{QueryActorRef, QueryCommand};
use crate::cache::{CacheStore, CachedActor, Lease};
use crate::error::{EngineError, FetchError};
use crate::keys::MutationKey;
use crate::options::MutationOptions;
use crate::relay::{ErrorRecord, ErrorRelay, Marker, OperationKind};
use crate::reply::Reply;
use crate::state::{MutationState, Revision, Revisioned, Timestamp};

// =============================================================================
// Query Effects
// =============================================================================

/// Access to cached queries from a mutation's cache-update hook.
#[derive(Clone)]
pub struct QueryEffect {
    store: CacheStore,
}

impl QueryEffect {
    pub(crate) fn new(store: CacheStore) -> Self {
        Self { store }
    }

    /// Invalidate every cached query matching `pattern`.
    pub async fn invalidate_queries(&self, pattern: &KeyPattern) -> usize {
        self.store.invalidate_queries(pattern).await
    }

    /// Queue a reply replacement on a cached query.
    ///
    /// Returns `Ok(false)` when the query is not cached. The update runs after
    /// any command already queued on that query.
    pub async fn update_query<T, F>(&self, id: &QueryId, updater: F) -> Result<bool, EngineError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(&Reply<T>) -> Reply<T> + Send + 'static,
    {
        let Some(actor) = self
            .store
            .get::<QueryActorRef<T>>(OperationKind::Query, id.as_str())?
        else {
            debug!(query = %id, "Query not cached, update skipped");
            return Ok(false);
        };

        actor
            .send(QueryCommand::Update {
                updater: Box::new(updater),
            })
            .await?;
        Ok(true)
    }
}

impl fmt::Debug for QueryEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEffect").finish_non_exhaustive()
    }
}

// =============================================================================
// Messages
// =============================================================================

/// What a mutate call resolves to: `Ok(None)` when the call was dropped.
pub type MutateResult<S> = Result<Option<S>, EngineError>;

pub(crate) enum MutationCommand<V, S> {
    Mutate {
        variable: V,
        revision: Option<Revision>,
        reply_to: oneshot::Sender<MutateResult<S>>,
    },

    /// Back to idle, unconditionally.
    Reset,
}

impl<V, S> fmt::Debug for MutationCommand<V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mutate { revision, .. } => {
                f.debug_struct("Mutate").field("revision", revision).finish()
            }
            Self::Reset => f.write_str("Reset"),
        }
    }
}

// =============================================================================
// Mutation Actor
// =============================================================================

pub(crate) struct MutationActor<K: MutationKey<R>, R> {
    name: String,
    id: MutationId,
    marker: Marker,
    key: Arc<K>,
    receiver: Arc<R>,
    options: MutationOptions,
    state: Arc<watch::Sender<MutationState<K::Data>>>,
    effect: QueryEffect,
    relay: ErrorRelay,
    /// Snapshot to restore if the running mutate is cancelled.
    rollback: Option<MutationState<K::Data>>,
}

impl<K, R> MutationActor<K, R>
where
    K: MutationKey<R>,
    R: Send + Sync + 'static,
{
    fn publish(&self, next: impl FnOnce(&MutationState<K::Data>) -> MutationState<K::Data>) {
        let next = {
            let current = self.state.borrow();
            next(&current)
        };
        self.state.send_replace(next);
    }

    async fn mutate(
        &mut self,
        variable: K::Variable,
        revision: Option<Revision>,
    ) -> MutateResult<K::Data> {
        let snapshot = self.state.borrow().clone();

        if self.options.is_one_shot && snapshot.is_mutated() {
            debug!(mutation = %self.id, "One-shot mutation already applied, call dropped");
            return Ok(None);
        }
        if self.options.is_strict_mode && revision.is_some_and(|r| r != snapshot.revision()) {
            debug!(mutation = %self.id, "Mutate dropped, revision is outdated");
            return Ok(None);
        }

        self.publish(|state| state.pending(Timestamp::now()));
        self.rollback = Some(snapshot.clone());

        let key = Arc::clone(&self.key);
        let receiver = Arc::clone(&self.receiver);
        let span = debug_span!("mutate", mutation = %self.id, marker = %self.marker);
        let result = self
            .options
            .retry
            .execute(|| key.mutate(&receiver, &variable))
            .instrument(span)
            .await;

        self.rollback = None;
        let now = Timestamp::now();

        match result {
            Ok(data) => {
                if self.options.should_execute_effect_synchronously {
                    self.key.on_query_update(&self.effect, &variable, &data).await;
                    self.key.on_mutate_effect(&variable, &data).await;
                    self.publish_success(data.clone(), now);
                } else {
                    self.publish_success(data.clone(), now);
                    let key = Arc::clone(&self.key);
                    let effect = self.effect.clone();
                    let effect_data = data.clone();
                    tokio::spawn(
                        async move {
                            key.on_query_update(&effect, &variable, &effect_data).await;
                            key.on_mutate_effect(&variable, &effect_data).await;
                        }
                        .instrument(debug_span!("mutate_effect", mutation = %self.id)),
                    );
                }
                Ok(Some(data))
            }
            Err(FetchError::Cancelled) => {
                debug!(mutation = %self.id, "Mutation cancelled, state restored");
                self.state.send_replace(snapshot);
                Err(EngineError::Cancelled)
            }
            Err(error) => {
                warn!(mutation = %self.id, marker = %self.marker, error = %error, "Mutation failed");
                let key = &self.key;
                self.publish(|state| {
                    state.mutate_failed(error.clone(), now, |old, new| key.error_equals(old, new))
                });
                self.relay.report(
                    &self.options.hooks,
                    ErrorRecord {
                        kind: OperationKind::Mutation,
                        key: self.id.to_string(),
                        marker: self.marker.clone(),
                        error: error.clone(),
                        at: now,
                    },
                );
                Err(EngineError::Operation(error))
            }
        }
    }

    fn publish_success(&self, data: K::Data, now: Timestamp) {
        let key = &self.key;
        self.publish(|state| {
            state.mutate_succeeded(data, now, |old, new| key.content_equals(old, new))
        });
        debug!(mutation = %self.id, revision = %self.state.borrow().revision(), "Mutation succeeded");
    }
}

#[async_trait]
impl<K, R> Actor for MutationActor<K, R>
where
    K: MutationKey<R>,
    R: Send + Sync + 'static,
{
    type Message = MutationCommand<K::Variable, K::Data>;

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &mut self,
        msg: Self::Message,
        _ctx: &mut ActorContext,
    ) -> Result<bool, EngineError> {
        match msg {
            MutationCommand::Mutate {
                variable,
                revision,
                reply_to,
            } => {
                let result = self.mutate(variable, revision).await;
                // Caller may have stopped waiting
                let _ = reply_to.send(result);
            }
            MutationCommand::Reset => {
                self.publish(|state| state.reset(Timestamp::now()));
                info!(mutation = %self.id, "Mutation reset");
            }
        }

        Ok(true)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        if let Some(snapshot) = self.rollback.take() {
            debug!(mutation = %self.id, "Mutation cancelled by close, state restored");
            self.state.send_replace(snapshot);
        }
    }
}

// =============================================================================
// References and Handles
// =============================================================================

pub(crate) struct MutationActorRef<V, S> {
    id: MutationId,
    inner: ActorHandle<MutationCommand<V, S>>,
    state: Arc<watch::Sender<MutationState<S>>>,
}

impl<V, S> MutationActorRef<V, S>
where
    V: Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    pub(crate) fn spawn<K, R>(
        id: MutationId,
        marker: Marker,
        key: Arc<K>,
        receiver: Arc<R>,
        options: MutationOptions,
        effect: QueryEffect,
        relay: ErrorRelay,
    ) -> Arc<Self>
    where
        K: MutationKey<R, Variable = V, Data = S>,
        R: Send + Sync + 'static,
    {
        let (state, _) = watch::channel(MutationState::initial());
        let state = Arc::new(state);
        let mailbox_size = options.mailbox_size;

        let actor = MutationActor {
            name: format!("mutation:{id}"),
            id: id.clone(),
            marker,
            key,
            receiver,
            options,
            state: Arc::clone(&state),
            effect,
            relay,
            rollback: None,
        };

        Arc::new(Self {
            id,
            inner: spawn(actor, mailbox_size),
            state,
        })
    }
}

#[async_trait]
impl<V, S> CachedActor for MutationActorRef<V, S>
where
    V: Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    fn kind(&self) -> OperationKind {
        OperationKind::Mutation
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
        Ok(())
    }

    async fn invalidate(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn close(&self) {
        self.inner.close();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

/// Handle to a mutation. Holding it keeps the mutation cached.
pub struct MutationHandle<V, S> {
    actor: Arc<MutationActorRef<V, S>>,
    lease: Lease,
}

impl<V, S> Clone for MutationHandle<V, S> {
    fn clone(&self) -> Self {
        Self {
            actor: Arc::clone(&self.actor),
            lease: self.lease.clone(),
        }
    }
}

impl<V, S> fmt::Debug for MutationHandle<V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationHandle")
            .field("id", &self.actor.id)
            .finish()
    }
}

impl<V, S> MutationHandle<V, S>
where
    V: Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(actor: Arc<MutationActorRef<V, S>>, lease: Lease) -> Self {
        Self { actor, lease }
    }

    pub fn id(&self) -> &MutationId {
        &self.actor.id
    }

    pub fn state(&self) -> MutationState<S> {
        self.actor.state.borrow().clone()
    }

    pub fn revision(&self) -> Revision {
        self.actor.state.borrow().revision()
    }

    pub fn subscribe(&self) -> watch::Receiver<MutationState<S>> {
        self.actor.state.subscribe()
    }

    pub fn watch(&self) -> WatchStream<MutationState<S>> {
        WatchStream::new(self.subscribe())
    }

    /// Run the mutation and wait for its result.
    ///
    /// Returns `Ok(None)` when the call was dropped (one-shot already applied,
    /// or outdated revision in strict mode).
    pub async fn mutate(&self, variable: V) -> MutateResult<S> {
        let revision = self.revision();
        self.mutate_with_revision(variable, revision).await
    }

    /// Like [`mutate`](Self::mutate), guarded by a revision observed earlier.
    pub async fn mutate_with_revision(&self, variable: V, revision: Revision) -> MutateResult<S> {
        let (reply_to, reply) = oneshot::channel();
        self.actor
            .inner
            .send(MutationCommand::Mutate {
                variable,
                revision: Some(revision),
                reply_to,
            })
            .await?;

        // Sender dropped means the command was cancelled by close
        reply.await.map_err(|_| EngineError::Cancelled)?
    }

    pub async fn reset(&self) -> Result<(), EngineError> {
        self.actor.inner.send(MutationCommand::Reset).await
    }

    pub fn close(&self) {
        self.actor.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.actor.inner.is_closed()
    }

    pub async fn join(&self) {
        self.actor.inner.join().await;
    }
}
