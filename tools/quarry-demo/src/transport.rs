//! In-memory todo service standing in for a network transport.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use quarry_engine::FetchError;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Todo {
    pub id: u64,
    pub title: String,
}

/// Todo list held in memory, with simulated latency and failures.
pub struct MemoryTransport {
    todos: Mutex<Vec<Todo>>,
    next_id: AtomicU64,
    calls: AtomicU32,
    latency: Duration,
    /// Every Nth call fails with a transient error.
    fail_every: Option<u32>,
    added: broadcast::Sender<Todo>,
}

impl MemoryTransport {
    pub fn new(latency: Duration, fail_every: Option<u32>) -> Self {
        let (added, _) = broadcast::channel(64);
        Self {
            todos: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            calls: AtomicU32::new(0),
            latency,
            fail_every: fail_every.filter(|n| *n > 0),
            added,
        }
    }

    fn todos(&self) -> MutexGuard<'_, Vec<Todo>> {
        self.todos.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn round_trip(&self, op: &str) -> Result<(), FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.latency).await;

        if self.fail_every.is_some_and(|n| call % n == 0) {
            debug!(op, call, "Simulated transport failure");
            return Err(FetchError::transient(format!("{op}: connection reset")));
        }
        Ok(())
    }

    pub async fn count(&self) -> Result<usize, FetchError> {
        self.round_trip("count").await?;
        Ok(self.todos().len())
    }

    pub async fn list(&self, offset: usize, limit: usize) -> Result<Vec<Todo>, FetchError> {
        self.round_trip("list").await?;
        Ok(self.todos().iter().skip(offset).take(limit).cloned().collect())
    }

    pub async fn add(&self, title: &str) -> Result<Todo, FetchError> {
        self.round_trip("add").await?;
        let todo = Todo {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            title: title.to_string(),
        };
        self.todos().push(todo.clone());
        // No listeners is fine
        let _ = self.added.send(todo.clone());
        Ok(todo)
    }

    /// Todos added from now on.
    pub fn added(&self) -> BoxStream<'static, Result<Todo, FetchError>> {
        stream::unfold(self.added.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(todo) => return Some((Ok(todo), rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Todo feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
