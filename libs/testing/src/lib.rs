//! Shared fixtures for quarry integration tests.
//!
//! [`FakeBackend`] stands in for a transport receiver. It stores integer
//! values per key, counts calls, tracks how many calls overlap, and can be
//! scripted to fail or to block until released. The keys in this crate are
//! thin operation definitions over it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::{BoxStream, StreamExt};
use quarry_engine::{
    FetchError, InfiniteQueryKey, MutationKey, MutationOptions, QueryChunks, QueryEffect,
    QueryKey, QueryOptions, Reply, RetryPolicy, SubscriptionKey,
};
use quarry_id::{KeyPattern, MutationId, QueryId, SubscriptionId};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;

/// Install a test log subscriber. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quarry_engine=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A retry policy with fixed, jitter-free delays.
pub fn fixed_retry(max_retries: u32, base: Duration, multiplier: f64) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: base,
        multiplier,
        max_delay: Duration::from_secs(60),
        jitter: 0.0,
        observer: None,
    }
}

// =============================================================================
// Fake Backend
// =============================================================================

type FeedItem = (String, Option<Result<i64, FetchError>>);

#[derive(Default)]
struct Script {
    values: HashMap<String, i64>,
    calls: HashMap<String, u32>,
    opens: HashMap<String, u32>,
    failures: HashMap<String, VecDeque<FetchError>>,
}

/// In-memory transport with call accounting.
pub struct FakeBackend {
    script: Mutex<Script>,
    latency: Mutex<Duration>,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    /// `true` while calls are held.
    gate: watch::Sender<bool>,
    feed: broadcast::Sender<FeedItem>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        let (feed, _) = broadcast::channel(256);
        Self {
            script: Mutex::new(Script::default()),
            latency: Mutex::new(Duration::ZERO),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            gate,
            feed,
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stored value for `key`, 0 if unset.
    pub fn value(&self, key: &str) -> i64 {
        self.script().values.get(key).copied().unwrap_or_default()
    }

    pub fn set(&self, key: &str, value: i64) {
        self.script().values.insert(key.to_string(), value);
    }

    /// Number of read and write calls made for `key`, retries included.
    pub fn calls(&self, key: &str) -> u32 {
        self.script().calls.get(key).copied().unwrap_or_default()
    }

    /// Number of times a stream was opened for `key`.
    pub fn opens(&self, key: &str) -> u32 {
        self.script().opens.get(key).copied().unwrap_or_default()
    }

    /// Highest number of calls that were running at the same time.
    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every call sleeps this long before answering.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// The next call for `key` fails with `error`. Queued failures are used
    /// in order before any call succeeds again.
    pub fn fail_next(&self, key: &str, error: FetchError) {
        self.script()
            .failures
            .entry(key.to_string())
            .or_default()
            .push_back(error);
    }

    /// Block every call until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.send_replace(true);
    }

    pub fn release(&self) {
        self.gate.send_replace(false);
    }

    /// Push an item to every open stream for `key`.
    pub fn publish(&self, key: &str, item: Result<i64, FetchError>) {
        let _ = self.feed.send((key.to_string(), Some(item)));
    }

    /// End every open stream for `key`.
    pub fn end_stream(&self, key: &str) {
        let _ = self.feed.send((key.to_string(), None));
    }

    pub async fn read(&self, key: &str) -> Result<i64, FetchError> {
        self.call(key, None).await
    }

    pub async fn write(&self, key: &str, value: i64) -> Result<i64, FetchError> {
        self.call(key, Some(value)).await
    }

    /// Page `page` of `key`: `size` consecutive numbers starting at `page * size`.
    pub async fn read_page(&self, key: &str, page: u32, size: u32) -> Result<Vec<u32>, FetchError> {
        self.call(key, None).await?;
        Ok((page * size..(page + 1) * size).collect())
    }

    pub fn stream(&self, key: &str) -> BoxStream<'static, Result<i64, FetchError>> {
        *self.script().opens.entry(key.to_string()).or_default() += 1;

        let key = key.to_string();
        BroadcastStream::new(self.feed.subscribe())
            .filter_map(move |msg| {
                let item = match msg {
                    Ok((k, item)) if k == key => Some(item),
                    _ => None,
                };
                future::ready(item)
            })
            .take_while(|item| future::ready(item.is_some()))
            .filter_map(future::ready)
            .boxed()
    }

    async fn call(&self, key: &str, write: Option<i64>) -> Result<i64, FetchError> {
        *self.script().calls.entry(key.to_string()).or_default() += 1;
        let _guard = InFlight::enter(self);

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|held| !*held).await;

        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut script = self.script();
        if let Some(error) = script.failures.get_mut(key).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        match write {
            Some(value) => {
                script.values.insert(key.to_string(), value);
                Ok(value)
            }
            None => Ok(script.values.get(key).copied().unwrap_or_default()),
        }
    }
}

struct InFlight<'a>(&'a FakeBackend);

impl<'a> InFlight<'a> {
    fn enter(backend: &'a FakeBackend) -> Self {
        let now = backend.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        backend.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(backend)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Reads the backend value stored under its own id.
#[derive(Clone)]
pub struct CounterQuery {
    id: QueryId,
    stale_time: Option<Duration>,
    gc_time: Option<Option<Duration>>,
    retry: Option<RetryPolicy>,
    strict: bool,
    compare_content: bool,
    initial: Option<i64>,
}

impl CounterQuery {
    pub fn new(key: &str) -> Self {
        Self {
            id: QueryId::new(key).expect("valid query key"),
            stale_time: None,
            gc_time: None,
            retry: Some(RetryPolicy::none()),
            strict: false,
            compare_content: false,
            initial: None,
        }
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn gc_time(mut self, gc_time: Option<Duration>) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Treat equal values as unchanged content.
    pub fn compare_content(mut self) -> Self {
        self.compare_content = true;
        self
    }

    pub fn initial(mut self, value: i64) -> Self {
        self.initial = Some(value);
        self
    }
}

#[async_trait]
impl QueryKey<FakeBackend> for CounterQuery {
    type Data = i64;

    fn id(&self) -> QueryId {
        self.id.clone()
    }

    async fn fetch(&self, backend: &FakeBackend) -> Result<i64, FetchError> {
        backend.read(self.id.as_str()).await
    }

    fn configure(&self, mut options: QueryOptions) -> QueryOptions {
        if let Some(stale_time) = self.stale_time {
            options.stale_time = stale_time;
        }
        if let Some(gc_time) = self.gc_time {
            options.gc_time = gc_time;
        }
        if let Some(retry) = &self.retry {
            options.retry = retry.clone();
        }
        options.is_strict_mode |= self.strict;
        options
    }

    fn initial_data(&self) -> Option<i64> {
        self.initial
    }

    fn content_equals(&self, old: &i64, new: &i64) -> bool {
        self.compare_content && old == new
    }
}

/// Same id as a [`CounterQuery`], different value type.
pub struct LabelQuery {
    id: QueryId,
}

impl LabelQuery {
    pub fn new(key: &str) -> Self {
        Self {
            id: QueryId::new(key).expect("valid query key"),
        }
    }
}

#[async_trait]
impl QueryKey<FakeBackend> for LabelQuery {
    type Data = String;

    fn id(&self) -> QueryId {
        self.id.clone()
    }

    async fn fetch(&self, backend: &FakeBackend) -> Result<String, FetchError> {
        backend.read(self.id.as_str()).await.map(|v| v.to_string())
    }
}

/// Pages of consecutive numbers; `pages` pages in total.
pub struct NumberPages {
    id: QueryId,
    page_size: u32,
    pages: u32,
}

impl NumberPages {
    pub fn new(key: &str, page_size: u32, pages: u32) -> Self {
        Self {
            id: QueryId::new(key).expect("valid query key"),
            page_size,
            pages,
        }
    }
}

#[async_trait]
impl InfiniteQueryKey<FakeBackend> for NumberPages {
    type Chunk = Vec<u32>;
    type Param = u32;

    fn id(&self) -> QueryId {
        self.id.clone()
    }

    fn initial_param(&self) -> u32 {
        0
    }

    fn load_more_param(&self, chunks: &QueryChunks<Vec<u32>, u32>) -> Option<u32> {
        let next = chunks.last().map_or(0, |chunk| chunk.param + 1);
        (next < self.pages).then_some(next)
    }

    async fn fetch(&self, backend: &FakeBackend, page: u32) -> Result<Vec<u32>, FetchError> {
        backend
            .read_page(self.id.as_str(), page, self.page_size)
            .await
    }

    fn configure(&self, mut options: QueryOptions) -> QueryOptions {
        options.retry = RetryPolicy::none();
        options
    }
}

/// Writes its variable to the backend value of `target`.
///
/// On success it can patch the target query's cached reply and invalidate a
/// pattern of queries. `effects` counts generic effect hook runs.
pub struct SetCounter {
    id: MutationId,
    target: QueryId,
    patch_target: bool,
    invalidates: Option<KeyPattern>,
    one_shot: bool,
    strict: bool,
    sync_effects: bool,
    effect_delay: Duration,
    retry: Option<RetryPolicy>,
    pub effects: Arc<AtomicU32>,
}

impl SetCounter {
    pub fn new(key: &str, target: &str) -> Self {
        Self {
            id: MutationId::new(key).expect("valid mutation key"),
            target: QueryId::new(target).expect("valid query key"),
            patch_target: false,
            invalidates: None,
            one_shot: false,
            strict: false,
            sync_effects: false,
            effect_delay: Duration::ZERO,
            retry: None,
            effects: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Write the result into the target query's cached reply.
    pub fn patch_target(mut self) -> Self {
        self.patch_target = true;
        self
    }

    pub fn invalidates(mut self, pattern: &str) -> Self {
        self.invalidates = Some(KeyPattern::parse(pattern).expect("valid pattern"));
        self
    }

    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn sync_effects(mut self) -> Self {
        self.sync_effects = true;
        self
    }

    /// The generic effect hook sleeps this long before counting.
    pub fn effect_delay(mut self, delay: Duration) -> Self {
        self.effect_delay = delay;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

#[async_trait]
impl MutationKey<FakeBackend> for SetCounter {
    type Variable = i64;
    type Data = i64;

    fn id(&self) -> MutationId {
        self.id.clone()
    }

    async fn mutate(&self, backend: &FakeBackend, value: &i64) -> Result<i64, FetchError> {
        backend.write(self.target.as_str(), *value).await
    }

    async fn on_query_update(&self, effect: &QueryEffect, _value: &i64, data: &i64) {
        if self.patch_target {
            let data = *data;
            let _ = effect
                .update_query::<i64, _>(&self.target, move |_| Reply::Some(data))
                .await;
        }
        if let Some(pattern) = &self.invalidates {
            effect.invalidate_queries(pattern).await;
        }
    }

    async fn on_mutate_effect(&self, _value: &i64, _data: &i64) {
        if !self.effect_delay.is_zero() {
            tokio::time::sleep(self.effect_delay).await;
        }
        self.effects.fetch_add(1, Ordering::SeqCst);
    }

    fn configure(&self, mut options: MutationOptions) -> MutationOptions {
        options.is_one_shot = self.one_shot;
        options.is_strict_mode |= self.strict;
        options.should_execute_effect_synchronously |= self.sync_effects;
        if let Some(retry) = &self.retry {
            options.retry = retry.clone();
        }
        options
    }
}

/// Streams the items the backend publishes under its id.
pub struct TickerSubscription {
    id: SubscriptionId,
}

impl TickerSubscription {
    pub fn new(key: &str) -> Self {
        Self {
            id: SubscriptionId::new(key).expect("valid subscription key"),
        }
    }
}

impl SubscriptionKey<FakeBackend> for TickerSubscription {
    type Data = i64;

    fn id(&self) -> SubscriptionId {
        self.id.clone()
    }

    fn subscribe(&self, backend: Arc<FakeBackend>) -> BoxStream<'static, Result<i64, FetchError>> {
        backend.stream(self.id.as_str())
    }
}
