//! Core actor framework types and traits.
//!
//! Provides the building blocks every operation actor runs on:
//! - `Actor` trait for defining actor behavior
//! - `ActorHandle` for sending commands, closing and joining
//! - `spawn` to start the single-writer loop on its own task

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::EngineError;

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Publish state only through channels they alone write to
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext,
    ) -> Result<bool, EngineError>;

    /// Next message produced by the actor itself (stream items).
    ///
    /// Must be cancel-safe: the loop drops it whenever a mailbox message or
    /// shutdown wins the race.
    async fn next_event(&mut self) -> Self::Message {
        std::future::pending().await
    }

    /// Called when the actor starts.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), EngineError> {
        Ok(())
    }

    /// Called when the actor is about to stop, including after a command
    /// was cancelled by `close`.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        // Default: no cleanup
    }
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    /// Actor's unique ID.
    pub actor_id: String,

    /// Mailbox messages processed so far.
    pub messages_processed: u64,
}

impl ActorContext {
    pub fn new(actor_id: String) -> Self {
        Self {
            actor_id,
            messages_processed: 0,
        }
    }
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M> {
    /// Sender for the actor's mailbox.
    tx: mpsc::Sender<M>,

    /// Actor ID for logging.
    actor_id: String,

    /// Mailbox messages accepted so far.
    submitted: Arc<AtomicU64>,

    /// Mailbox messages fully handled so far.
    completed: watch::Receiver<u64>,

    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl<M> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
            submitted: Arc::clone(&self.submitted),
            completed: self.completed.clone(),
            shutdown_tx: Arc::clone(&self.shutdown_tx),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message to the actor, waiting for mailbox capacity.
    pub async fn send(&self, msg: M) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::ActorStopped);
        }

        // Counted before enqueueing so a concurrent join never misses it
        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.tx.send(msg).await.map_err(|_| {
            self.submitted.fetch_sub(1, Ordering::SeqCst);
            EngineError::ActorStopped
        })
    }

    /// Try to send a message without blocking.
    pub fn try_send(&self, msg: M) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::ActorStopped);
        }

        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.tx.try_send(msg).map_err(|e| {
            self.submitted.fetch_sub(1, Ordering::SeqCst);
            match e {
                mpsc::error::TrySendError::Full(_) => EngineError::MailboxFull,
                mpsc::error::TrySendError::Closed(_) => EngineError::ActorStopped,
            }
        })
    }

    /// Get the actor ID.
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Signal the actor to stop. The in-flight message, if any, is cancelled.
    pub fn close(&self) {
        if !self.shutdown_tx.send_replace(true) {
            debug!(actor_id = %self.actor_id, "Closing actor");
        }
    }

    /// Returns true once `close` was called or the loop has exited.
    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow() || self.tx.is_closed()
    }

    /// Wait until every message submitted before this call has been handled,
    /// or the actor has stopped. Never cancels anything.
    pub async fn join(&self) {
        let target = self.submitted.load(Ordering::SeqCst);
        let mut completed = self.completed.clone();
        // Err means the loop exited; nothing left to wait for
        let _ = completed.wait_for(|done| *done >= target).await;
    }
}

// =============================================================================
// Spawning
// =============================================================================

/// Start an actor on its own task.
pub fn spawn<A: Actor>(actor: A, mailbox_size: usize) -> ActorHandle<A::Message> {
    let actor_id = format!("{}#{}", actor.name(), generate_actor_id());
    let (tx, rx) = mpsc::channel(mailbox_size.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (completed_tx, completed_rx) = watch::channel(0u64);

    tokio::spawn(run_actor_loop(
        actor,
        rx,
        shutdown_rx,
        completed_tx,
        actor_id.clone(),
    ));

    debug!(actor_id = %actor_id, "Spawned actor");

    ActorHandle {
        tx,
        actor_id,
        submitted: Arc::new(AtomicU64::new(0)),
        completed: completed_rx,
        shutdown_tx: Arc::new(shutdown_tx),
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

enum Next<M> {
    Mailbox(M),
    Event(M),
    Stop,
}

/// Run the main actor loop.
async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    completed: watch::Sender<u64>,
    actor_id: String,
) {
    let mut ctx = ActorContext::new(actor_id.clone());

    if let Err(e) = actor.on_start(&mut ctx).await {
        warn!(actor_id = %actor_id, error = %e, "Actor failed to start");
        return;
    }

    loop {
        let next = tokio::select! {
            biased;

            // Check shutdown first
            _ = stopped(&mut shutdown) => Next::Stop,

            msg = rx.recv() => match msg {
                Some(msg) => Next::Mailbox(msg),
                None => Next::Stop,
            },

            event = actor.next_event() => Next::Event(event),
        };

        let (msg, from_mailbox) = match next {
            Next::Mailbox(msg) => (msg, true),
            Next::Event(msg) => (msg, false),
            Next::Stop => break,
        };

        let outcome = tokio::select! {
            biased;

            _ = stopped(&mut shutdown) => {
                debug!(actor_id = %actor_id, "In-flight message cancelled");
                None
            }

            result = actor.handle(msg, &mut ctx) => Some(result),
        };

        if from_mailbox {
            ctx.messages_processed += 1;
            completed.send_replace(ctx.messages_processed);
        }

        match outcome {
            None => break,
            Some(Ok(true)) => {}
            Some(Ok(false)) => {
                debug!(actor_id = %actor_id, "Actor requested stop");
                break;
            }
            Some(Err(EngineError::ActorStopped)) => break,
            Some(Err(e)) => {
                warn!(actor_id = %actor_id, error = %e, "Actor error");
            }
        }
    }

    actor.on_stop(&mut ctx).await;

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

/// Resolves once shutdown was signalled or every handle is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

// =============================================================================
// Helpers
// =============================================================================

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================
