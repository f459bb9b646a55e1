//! Subscription actor - streamed reads.
//!
//! Stream items are fed through the same single-writer loop as mailbox
//! commands, so a reset never races with an item from the old stream.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use quarry_id::SubscriptionId;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use super::framework::{spawn, Actor, ActorContext, ActorHandle};
use crate::cache::{CachedActor, Lease};
use crate::error::{EngineError, FetchError};
use crate::keys::SubscriptionKey;
use crate::options::SubscriptionOptions;
use crate::relay::{ErrorRecord, ErrorRelay, Marker, OperationKind};
use crate::state::{Revision, Revisioned, SubscriptionState, Timestamp};

// =============================================================================
// Messages
// =============================================================================

pub(crate) enum SubscriptionCommand<T> {
    /// Open the stream if it is not open.
    Resume,

    /// Drop the stream, clear the state and open a fresh stream.
    Reset,

    /// Next stream item; `None` when the stream ended.
    Receive(Option<Result<T, FetchError>>),
}

impl<T> fmt::Debug for SubscriptionCommand<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resume => f.write_str("Resume"),
            Self::Reset => f.write_str("Reset"),
            Self::Receive(None) => f.write_str("Receive(end)"),
            Self::Receive(Some(Ok(_))) => f.write_str("Receive(item)"),
            Self::Receive(Some(Err(e))) => write!(f, "Receive({e})"),
        }
    }
}

// =============================================================================
// Subscription Actor
// =============================================================================

pub(crate) struct SubscriptionActor<K: SubscriptionKey<R>, R> {
    name: String,
    id: SubscriptionId,
    marker: Marker,
    key: Arc<K>,
    receiver: Arc<R>,
    options: SubscriptionOptions,
    state: Arc<watch::Sender<SubscriptionState<K::Data>>>,
    relay: ErrorRelay,
    stream: Option<BoxStream<'static, Result<K::Data, FetchError>>>,
}

impl<K, R> SubscriptionActor<K, R>
where
    K: SubscriptionKey<R>,
    R: Send + Sync + 'static,
{
    fn publish(
        &self,
        next: impl FnOnce(&SubscriptionState<K::Data>) -> SubscriptionState<K::Data>,
    ) {
        let next = {
            let current = self.state.borrow();
            next(&current)
        };
        self.state.send_replace(next);
    }

    fn open(&mut self) {
        self.stream = Some(self.key.subscribe(Arc::clone(&self.receiver)));
        self.publish(|state| state.streaming(true));
        debug!(subscription = %self.id, "Stream opened");
    }

    fn receive(&mut self, item: Option<Result<K::Data, FetchError>>) {
        let now = Timestamp::now();
        match item {
            Some(Ok(data)) => {
                let key = &self.key;
                self.publish(|state| {
                    state.received(data, now, |old, new| key.content_equals(old, new))
                });
            }
            Some(Err(FetchError::Cancelled)) => {
                debug!(subscription = %self.id, "Stream cancelled");
                self.stream = None;
                self.publish(|state| state.streaming(false));
            }
            Some(Err(error)) => {
                warn!(subscription = %self.id, marker = %self.marker, error = %error, "Stream failed");
                self.stream = None;
                let key = &self.key;
                self.publish(|state| {
                    state.failed(error.clone(), now, |old, new| key.error_equals(old, new))
                });
                self.relay.report(
                    &self.options.hooks,
                    ErrorRecord {
                        kind: OperationKind::Subscription,
                        key: self.id.to_string(),
                        marker: self.marker.clone(),
                        error,
                        at: now,
                    },
                );
            }
            None => {
                debug!(subscription = %self.id, "Stream ended");
                self.stream = None;
                self.publish(|state| state.streaming(false));
            }
        }
    }
}

#[async_trait]
impl<K, R> Actor for SubscriptionActor<K, R>
where
    K: SubscriptionKey<R>,
    R: Send + Sync + 'static,
{
    type Message = SubscriptionCommand<K::Data>;

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &mut self,
        msg: Self::Message,
        _ctx: &mut ActorContext,
    ) -> Result<bool, EngineError> {
        match msg {
            SubscriptionCommand::Resume => {
                if self.stream.is_none() {
                    self.open();
                }
            }
            SubscriptionCommand::Reset => {
                self.stream = None;
                self.publish(|state| state.restarted(Timestamp::now()));
                info!(subscription = %self.id, "Subscription reset");
                self.open();
            }
            SubscriptionCommand::Receive(item) => self.receive(item),
        }

        Ok(true)
    }

    async fn next_event(&mut self) -> Self::Message {
        match self.stream.as_mut() {
            Some(stream) => SubscriptionCommand::Receive(stream.next().await),
            None => std::future::pending().await,
        }
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        if self.stream.take().is_some() {
            self.publish(|state| state.streaming(false));
        }
    }
}

// =============================================================================
// References and Handles
// =============================================================================

pub(crate) struct SubscriptionActorRef<T> {
    id: SubscriptionId,
    inner: ActorHandle<SubscriptionCommand<T>>,
    state: Arc<watch::Sender<SubscriptionState<T>>>,
}

impl<T: Clone + Send + Sync + 'static> SubscriptionActorRef<T> {
    pub(crate) fn spawn<K, R>(
        id: SubscriptionId,
        marker: Marker,
        key: Arc<K>,
        receiver: Arc<R>,
        options: SubscriptionOptions,
        relay: ErrorRelay,
    ) -> Arc<Self>
    where
        K: SubscriptionKey<R, Data = T>,
        R: Send + Sync + 'static,
    {
        let (state, _) = watch::channel(SubscriptionState::initial());
        let state = Arc::new(state);
        let mailbox_size = options.mailbox_size;

        let actor = SubscriptionActor {
            name: format!("subscription:{id}"),
            id: id.clone(),
            marker,
            key,
            receiver,
            options,
            state: Arc::clone(&state),
            relay,
            stream: None,
        };

        Arc::new(Self {
            id,
            inner: spawn(actor, mailbox_size),
            state,
        })
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> CachedActor for SubscriptionActorRef<T> {
    fn kind(&self) -> OperationKind {
        OperationKind::Subscription
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
        self.inner.send(SubscriptionCommand::Resume).await
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

/// Handle to a subscription. Holding it keeps the subscription cached.
pub struct SubscriptionHandle<T> {
    actor: Arc<SubscriptionActorRef<T>>,
    lease: Lease,
}

impl<T> Clone for SubscriptionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            actor: Arc::clone(&self.actor),
            lease: self.lease.clone(),
        }
    }
}

impl<T> fmt::Debug for SubscriptionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.actor.id)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> SubscriptionHandle<T> {
    pub(crate) fn new(actor: Arc<SubscriptionActorRef<T>>, lease: Lease) -> Self {
        Self { actor, lease }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.actor.id
    }

    pub fn state(&self) -> SubscriptionState<T> {
        self.actor.state.borrow().clone()
    }

    pub fn revision(&self) -> Revision {
        self.actor.state.borrow().revision()
    }

    pub fn subscribe(&self) -> watch::Receiver<SubscriptionState<T>> {
        self.actor.state.subscribe()
    }

    pub fn watch(&self) -> WatchStream<SubscriptionState<T>> {
        WatchStream::new(self.subscribe())
    }

    /// Open the stream if it is not already open.
    pub async fn resume(&self) -> Result<(), EngineError> {
        self.actor.inner.send(SubscriptionCommand::Resume).await
    }

    /// Re-establish the stream from a cleared state.
    pub async fn reset(&self) -> Result<(), EngineError> {
        self.actor.inner.send(SubscriptionCommand::Reset).await
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
