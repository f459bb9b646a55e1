//! Reference-counted actor cache with idle garbage collection.
//!
//! The store exclusively owns actor lifetimes. Holders get a [`Lease`]; the
//! last lease to drop starts the entry's idle clock, and a sweep evicts
//! entries that stayed unreferenced for their `gc_time`. Referenced entries
//! are never evicted.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use quarry_id::KeyPattern;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::relay::OperationKind;

/// Type-erased view of an operation actor, as the store sees it.
#[async_trait]
pub trait CachedActor: Send + Sync + 'static {
    fn kind(&self) -> OperationKind;

    fn key(&self) -> &str;

    /// True while at least one state subscriber exists.
    fn is_observed(&self) -> bool;

    fn is_closed(&self) -> bool;

    async fn resume(&self) -> Result<(), EngineError>;

    async fn invalidate(&self) -> Result<(), EngineError>;

    fn close(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

type CacheKey = (OperationKind, String);

struct CacheEntry {
    actor: Arc<dyn CachedActor>,
    /// Distinguishes this entry from earlier ones under the same key.
    generation: u64,
    ref_count: u32,
    /// Set when `ref_count` drops to zero.
    last_released_at: Option<Instant>,
    /// `None` means never evicted.
    gc_time: Option<Duration>,
}

impl CacheEntry {
    fn is_evictable(&self, now: Instant) -> bool {
        if self.ref_count > 0 {
            return false;
        }
        if self.actor.is_closed() {
            return true;
        }
        match (self.gc_time, self.last_released_at) {
            (Some(gc_time), Some(released)) => now.saturating_duration_since(released) >= gc_time,
            _ => false,
        }
    }
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

struct Inner {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    next_generation: AtomicU64,
    stats: CacheStats,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retain(&self, key: &CacheKey, generation: u64) {
        if let Some(entry) = self.entries().get_mut(key) {
            if entry.generation == generation {
                entry.ref_count += 1;
                entry.last_released_at = None;
            }
        }
    }

    /// Drops one reference. With `close_if_last`, an entry left unreferenced
    /// is removed and its actor returned for closing.
    fn release(
        &self,
        key: &CacheKey,
        generation: u64,
        close_if_last: bool,
    ) -> Option<Arc<dyn CachedActor>> {
        let mut entries = self.entries();
        let entry = entries.get_mut(key)?;
        // Leases from an entry that was closed and replaced
        if entry.generation != generation {
            debug!(kind = %key.0, key = %key.1, "Ignored release of a stale lease");
            return None;
        }

        entry.ref_count = entry.ref_count.saturating_sub(1);
        debug!(
            kind = %key.0,
            key = %key.1,
            ref_count = entry.ref_count,
            "Released cache reference"
        );
        if entry.ref_count > 0 {
            return None;
        }

        if close_if_last {
            return entries.remove(key).map(|entry| entry.actor);
        }
        entry.last_released_at = Some(Instant::now());
        None
    }
}

/// Shared actor cache. Cloning shares the same map.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Returns the cached actor for `key`, building it with `factory` when
    /// absent or closed, and takes a reference on it.
    pub fn acquire<A, F>(
        &self,
        kind: OperationKind,
        key: &str,
        gc_time: Option<Duration>,
        factory: F,
    ) -> Result<(Arc<A>, Lease), EngineError>
    where
        A: CachedActor,
        F: FnOnce() -> Arc<A>,
    {
        self.sweep(Instant::now());

        let cache_key = (kind, key.to_string());
        let mut entries = self.inner.entries();

        match entries.get_mut(&cache_key) {
            Some(entry) if !entry.actor.is_closed() => {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
            }
            Some(entry) => {
                info!(kind = %kind, key = %key, "Restarting closed actor");
                let actor: Arc<dyn CachedActor> = factory();
                entry.actor = actor;
                entry.gc_time = gc_time;
            }
            None => {
                self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                let actor: Arc<dyn CachedActor> = factory();
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                entries.insert(
                    cache_key.clone(),
                    CacheEntry {
                        actor,
                        generation,
                        ref_count: 0,
                        last_released_at: None,
                        gc_time,
                    },
                );
                debug!(kind = %kind, key = %key, "Cached new actor");
            }
        }

        let Some(entry) = entries.get_mut(&cache_key) else {
            return Err(EngineError::ActorStopped);
        };

        let actor = Arc::clone(&entry.actor)
            .into_any()
            .downcast::<A>()
            .map_err(|_| EngineError::TypeMismatch {
                key: key.to_string(),
            })?;

        entry.ref_count += 1;
        entry.last_released_at = None;
        debug!(kind = %kind, key = %key, ref_count = entry.ref_count, "Acquired cache reference");

        let generation = entry.generation;
        Ok((
            actor,
            Lease {
                inner: Arc::clone(&self.inner),
                key: cache_key,
                generation,
                held: AtomicBool::new(true),
            },
        ))
    }

    /// Look up a live actor without taking a reference.
    pub(crate) fn get<A: CachedActor>(
        &self,
        kind: OperationKind,
        key: &str,
    ) -> Result<Option<Arc<A>>, EngineError> {
        let actor = {
            let entries = self.inner.entries();
            match entries.get(&(kind, key.to_string())) {
                Some(entry) if !entry.actor.is_closed() => Arc::clone(&entry.actor),
                _ => return Ok(None),
            }
        };

        actor
            .into_any()
            .downcast::<A>()
            .map(Some)
            .map_err(|_| EngineError::TypeMismatch {
                key: key.to_string(),
            })
    }

    /// Evicts every entry that has been unreferenced for its `gc_time`.
    /// Returns the number of evicted entries.
    pub fn sweep(&self, now: Instant) -> usize {
        let evicted: Vec<(CacheKey, Arc<dyn CachedActor>)> = {
            let mut entries = self.inner.entries();
            let keys: Vec<CacheKey> = entries
                .iter()
                .filter(|(_, entry)| entry.is_evictable(now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key).map(|entry| (key, entry.actor)))
                .collect()
        };

        // Close outside the lock
        for ((kind, key), actor) in &evicted {
            actor.close();
            self.inner.stats.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(kind = %kind, key = %key, "Evicted idle actor");
        }

        if !evicted.is_empty() {
            info!(count = evicted.len(), "GC sweep evicted actors");
        }

        evicted.len()
    }

    /// Invalidate every cached query whose key matches `pattern`. Matching
    /// entries are invalidated concurrently and never evicted.
    pub async fn invalidate_queries(&self, pattern: &KeyPattern) -> usize {
        let targets = self.live(|actor| {
            actor.kind() == OperationKind::Query && pattern.matches(actor.key())
        });

        let results = join_all(targets.iter().map(|actor| actor.invalidate())).await;
        for (actor, result) in targets.iter().zip(&results) {
            if let Err(e) = result {
                warn!(key = %actor.key(), error = %e, "Failed to invalidate query");
            }
        }

        debug!(pattern = %pattern, count = targets.len(), "Invalidated queries");
        targets.len()
    }

    /// Resume every query that currently has a state subscriber.
    pub async fn resume_observed_queries(&self) -> usize {
        let targets =
            self.live(|actor| actor.kind() == OperationKind::Query && actor.is_observed());

        let results = join_all(targets.iter().map(|actor| actor.resume())).await;
        for (actor, result) in targets.iter().zip(&results) {
            if let Err(e) = result {
                warn!(key = %actor.key(), error = %e, "Failed to resume query");
            }
        }

        info!(count = targets.len(), "Resumed observed queries");
        targets.len()
    }

    /// Close and forget every entry. Leases taken before the call no longer
    /// count against entries created afterwards.
    pub fn close_all(&self) {
        let actors: Vec<Arc<dyn CachedActor>> = {
            let mut entries = self.inner.entries();
            entries.drain().map(|(_, entry)| entry.actor).collect()
        };
        for actor in &actors {
            actor.close();
        }
        info!(count = actors.len(), "Closed all cached actors");
    }

    /// Current reference count of an entry, if cached.
    pub fn ref_count(&self, kind: OperationKind, key: &str) -> Option<u32> {
        self.inner
            .entries()
            .get(&(kind, key.to_string()))
            .map(|entry| entry.ref_count)
    }

    pub fn contains(&self, kind: OperationKind, key: &str) -> bool {
        self.inner.entries().contains_key(&(kind, key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics as `(hits, misses, evictions)`.
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.inner.stats.hits.load(Ordering::Relaxed),
            self.inner.stats.misses.load(Ordering::Relaxed),
            self.inner.stats.evictions.load(Ordering::Relaxed),
        )
    }

    fn live(&self, filter: impl Fn(&dyn CachedActor) -> bool) -> Vec<Arc<dyn CachedActor>> {
        self.inner
            .entries()
            .values()
            .filter(|entry| !entry.actor.is_closed() && filter(entry.actor.as_ref()))
            .map(|entry| Arc::clone(&entry.actor))
            .collect()
    }
}

/// A counted reference to one cache entry. Dropping it releases the
/// reference; cloning takes another.
pub struct Lease {
    inner: Arc<Inner>,
    key: CacheKey,
    generation: u64,
    held: AtomicBool,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key.1
    }

    /// Release now and close the actor if this was its last reference.
    /// Releases at most once; dropping afterwards does nothing.
    pub fn retire(&self) {
        if !self.held.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(actor) = self.inner.release(&self.key, self.generation, true) {
            actor.close();
            debug!(kind = %self.key.0, key = %self.key.1, "Closed retired actor");
        }
    }
}

impl Clone for Lease {
    fn clone(&self) -> Self {
        let held = self.held.load(Ordering::SeqCst);
        if held {
            self.inner.retain(&self.key, self.generation);
        }
        Self {
            inner: Arc::clone(&self.inner),
            key: self.key.clone(),
            generation: self.generation,
            held: AtomicBool::new(held),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.held.swap(false, Ordering::SeqCst) {
            self.inner.release(&self.key, self.generation, false);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("kind", &self.key.0)
            .field("key", &self.key.1)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
