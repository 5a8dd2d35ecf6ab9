//! Stale-while-revalidate result cache for idempotent reads.
//!
//! Entries move through three ages:
//! - younger than `stale_after`: served without touching the network
//! - younger than `expire_after`: served immediately, with one background
//!   revalidation
//! - older: evicted on access, the caller waits for a fresh fetch
//!
//! Every fetch takes a sequence number when it starts. A result is only
//! committed if it started after the entry it would replace, the key's last
//! invalidation and the last clear, so a slow response can never overwrite
//! newer data or resurrect invalidated data.

use codelingo_core::RequestError;
use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::retry::RetryPolicy;
use crate::singleflight::SingleFlight;

/// Staleness thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Age after which an entry is served stale and revalidated.
    pub stale_after: Duration,
    /// Age after which an entry is never served.
    pub expire_after: Duration,
}

impl CacheConfig {
    pub fn new(stale_after: Duration, expire_after: Duration) -> Self {
        Self {
            stale_after,
            expire_after,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5 * 60),
            expire_after: Duration::from_secs(30 * 60),
        }
    }
}

/// Logical identity of a read, as ordered segments (`["courses", "42"]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// This key extended by one segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// How a read was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// From cache, within `stale_after`.
    Fresh,
    /// From cache, past `stale_after`; a revalidation is running.
    Stale,
    /// From the network.
    Fetched,
}

/// A cache read with its freshness metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    value: T,
    freshness: Freshness,
    age: Duration,
}

impl<T> CacheRead<T> {
    fn new(value: T, freshness: Freshness, age: Duration) -> Self {
        Self {
            value,
            freshness,
            age,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn freshness(&self) -> Freshness {
        self.freshness
    }

    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }

    pub fn was_cache_hit(&self) -> bool {
        self.freshness != Freshness::Fetched
    }

    /// Age of the payload when it was read.
    pub fn age(&self) -> Duration {
        self.age
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheRead<U> {
        CacheRead {
            value: f(self.value),
            freshness: self.freshness,
            age: self.age,
        }
    }
}

impl CacheRead<Value> {
    /// Decode the JSON payload, keeping the metadata.
    pub fn decode<U: DeserializeOwned>(self) -> Result<CacheRead<U>, RequestError> {
        let value = serde_json::from_value(self.value).map_err(|e| RequestError::InvalidResponse {
            reason: format!("cached payload: {}", e),
        })?;
        Ok(CacheRead {
            value,
            freshness: self.freshness,
            age: self.age,
        })
    }
}

/// Counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub revalidations: u64,
    /// Fetch results dropped by fetch-start ordering.
    pub discarded: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Value,
    fetched_at: Instant,
    fetch_seq: u64,
    revalidating: bool,
}

/// Fetches running for one key.
#[derive(Debug, Default)]
struct Pending {
    running: usize,
    /// Sequence of the last invalidation while these fetches ran; fetches
    /// that started before it may not commit.
    floor: u64,
}

/// Everything behind the cache lock. Keys only appear here while they hold
/// a payload or have a fetch running.
#[derive(Debug, Default)]
struct State {
    entries: HashMap<QueryKey, CacheEntry>,
    pending: HashMap<QueryKey, Pending>,
    /// Sequence of the last `clear`; no fetch started before it commits.
    cleared_at: u64,
}

impl State {
    fn invalidate(&mut self, key: &QueryKey, floor: u64) -> bool {
        let had_entry = self.entries.remove(key).is_some();
        match self.pending.get_mut(key) {
            Some(pending) => {
                pending.floor = floor;
                true
            }
            None => had_entry,
        }
    }
}

type FetchOutcome = Result<Value, RequestError>;
type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, FetchOutcome> + Send + Sync>;

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    revalidations: AtomicU64,
    discarded: AtomicU64,
}

struct Inner {
    config: CacheConfig,
    retry: RetryPolicy,
    state: Mutex<State>,
    /// Only advanced while holding `state`.
    seq: AtomicU64,
    flights: SingleFlight<QueryKey, FetchOutcome>,
    counters: Counters,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a fetch of `key` and return its start sequence.
    fn begin_fetch(&self, key: &QueryKey) -> u64 {
        let mut state = self.state();
        let seq = self.next_seq();
        state.pending.entry(key.clone()).or_default().running += 1;
        seq
    }

    fn end_fetch(&self, key: &QueryKey) {
        let mut state = self.state();
        if let Some(pending) = state.pending.get_mut(key) {
            pending.running = pending.running.saturating_sub(1);
            if pending.running == 0 {
                state.pending.remove(key);
            }
        }
    }

    /// Store `payload` if `seq` is newer than the entry, the key's last
    /// invalidation and the last clear.
    fn commit(&self, key: &QueryKey, seq: u64, payload: Value) -> bool {
        let mut state = self.state();
        let cleared_at = state.cleared_at;
        let floor = state
            .pending
            .get(key)
            .map_or(cleared_at, |p| p.floor.max(cleared_at));
        let newer_than_entry = state.entries.get(key).map_or(true, |e| seq > e.fetch_seq);
        if seq <= floor || !newer_than_entry {
            tracing::debug!(key = %key, seq, floor, "discarding out-of-order result");
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        state.entries.insert(
            key.clone(),
            CacheEntry {
                payload,
                fetched_at: Instant::now(),
                fetch_seq: seq,
                revalidating: false,
            },
        );
        true
    }

    /// Join or start the fetch flight for `key`.
    async fn fetch(self: &Arc<Self>, key: &QueryKey, fetcher: &Fetcher) -> FetchOutcome {
        self.flights
            .run(key.clone(), || {
                // Taken when the flight starts, before any await.
                let seq = self.begin_fetch(key);
                let running = FetchGuard {
                    inner: self.clone(),
                    key: key.clone(),
                };
                let fetcher = fetcher.clone();
                async move {
                    let label = running.key.to_string();
                    let outcome = running.inner.retry.run(&label, || fetcher()).await;
                    if let Ok(payload) = &outcome {
                        running.inner.commit(&running.key, seq, payload.clone());
                    }
                    outcome
                }
                .boxed()
            })
            .await
    }

    /// Revalidate the stale entry that was committed at `stale_seq`.
    fn revalidate(self: &Arc<Self>, key: QueryKey, stale_seq: u64, fetcher: Fetcher) {
        let inner = self.clone();
        tokio::spawn(async move {
            let outcome = inner.fetch(&key, &fetcher).await;
            if let Some(entry) = inner.state().entries.get_mut(&key) {
                // A newer entry starts with its own flag.
                if entry.fetch_seq == stale_seq {
                    entry.revalidating = false;
                }
            }
            match outcome {
                Ok(_) => tracing::debug!(key = %key, "revalidated"),
                Err(err) => tracing::warn!(key = %key, error = %err, "revalidation failed; keeping stale entry"),
            }
        });
    }
}

/// Unregisters a fetch when its flight finishes or is dropped.
struct FetchGuard {
    inner: Arc<Inner>,
    key: QueryKey,
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        self.inner.end_fetch(&self.key);
    }
}

enum Lookup {
    Fresh(Value, Duration),
    Stale {
        payload: Value,
        age: Duration,
        revalidate_seq: Option<u64>,
    },
    Miss,
}

/// Shared handle to the cache; clones refer to the same entries.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<Inner>,
}

impl ResultCache {
    pub fn new(config: CacheConfig, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                retry,
                state: Mutex::new(State::default()),
                seq: AtomicU64::new(0),
                flights: SingleFlight::new(),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.inner.config
    }

    /// Read `key`, fetching with `fetch` when needed.
    ///
    /// Must be called inside a tokio runtime: stale reads spawn their
    /// revalidation.
    pub async fn get<F, Fut>(&self, key: &QueryKey, fetch: F) -> Result<CacheRead<Value>, RequestError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RequestError>> + Send + 'static,
    {
        let fetcher: Fetcher = Arc::new(move || fetch().boxed());
        let inner = &self.inner;

        match self.lookup(key) {
            Lookup::Fresh(payload, age) => {
                inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %key, "cache hit");
                Ok(CacheRead::new(payload, Freshness::Fresh, age))
            }
            Lookup::Stale {
                payload,
                age,
                revalidate_seq,
            } => {
                inner.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
                if let Some(stale_seq) = revalidate_seq {
                    inner.counters.revalidations.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %key, age_ms = age.as_millis() as u64, "serving stale; revalidating");
                    inner.revalidate(key.clone(), stale_seq, fetcher);
                }
                Ok(CacheRead::new(payload, Freshness::Stale, age))
            }
            Lookup::Miss => {
                inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "cache miss");
                let payload = inner.fetch(key, &fetcher).await?;
                Ok(CacheRead::new(payload, Freshness::Fetched, Duration::ZERO))
            }
        }
    }

    fn lookup(&self, key: &QueryKey) -> Lookup {
        let config = self.inner.config;
        let mut state = self.inner.state();
        let Some(entry) = state.entries.get_mut(key) else {
            return Lookup::Miss;
        };

        let age = entry.fetched_at.elapsed();
        if age >= config.expire_after {
            tracing::debug!(key = %key, "evicting expired entry");
            state.entries.remove(key);
            Lookup::Miss
        } else if age >= config.stale_after {
            let revalidate_seq = (!entry.revalidating).then_some(entry.fetch_seq);
            entry.revalidating = true;
            Lookup::Stale {
                payload: entry.payload.clone(),
                age,
                revalidate_seq,
            }
        } else {
            Lookup::Fresh(entry.payload.clone(), age)
        }
    }

    /// The cached payload for `key` without fetching. Expired entries are
    /// not returned.
    pub fn peek(&self, key: &QueryKey) -> Option<CacheRead<Value>> {
        let config = self.inner.config;
        let state = self.inner.state();
        let entry = state.entries.get(key)?;
        let age = entry.fetched_at.elapsed();
        if age >= config.expire_after {
            return None;
        }
        let freshness = if age >= config.stale_after {
            Freshness::Stale
        } else {
            Freshness::Fresh
        };
        Some(CacheRead::new(entry.payload.clone(), freshness, age))
    }

    /// Seed `key` with a known payload, as if just fetched.
    pub fn set(&self, key: &QueryKey, payload: Value) {
        let seq = {
            let _state = self.inner.state();
            self.inner.next_seq()
        };
        self.inner.commit(key, seq, payload);
    }

    /// Drop `key`. The next read fetches, and no fetch started before
    /// this call may repopulate it.
    pub fn invalidate(&self, key: &QueryKey) {
        {
            let mut state = self.inner.state();
            let floor = self.inner.next_seq();
            state.invalidate(key, floor);
        }
        self.inner.flights.forget(key);
        tracing::debug!(key = %key, "invalidated");
    }

    /// Invalidate every key under `prefix`. Returns how many keys matched.
    pub fn invalidate_prefix(&self, prefix: &QueryKey) -> usize {
        let matched: Vec<QueryKey> = {
            let mut state = self.inner.state();
            let floor = self.inner.next_seq();
            let mut keys: Vec<QueryKey> = state
                .entries
                .keys()
                .chain(state.pending.keys())
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect();
            keys.sort_by(|a, b| a.segments().cmp(b.segments()));
            keys.dedup();
            for key in &keys {
                state.invalidate(key, floor);
            }
            keys
        };
        for key in &matched {
            self.inner.flights.forget(key);
        }
        tracing::debug!(prefix = %prefix, keys = matched.len(), "invalidated prefix");
        matched.len()
    }

    /// Drop everything (sign-out).
    pub fn clear(&self) {
        {
            let mut state = self.inner.state();
            state.cleared_at = self.inner.next_seq();
            state.entries.clear();
        }
        self.inner.flights.forget_all();
        tracing::debug!("cache cleared");
    }

    /// Number of keys currently holding a payload.
    pub fn len(&self) -> usize {
        self.inner.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            revalidations: c.revalidations.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(CacheConfig::default(), RetryPolicy::queries())
    }
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("config", &self.inner.config)
            .field("entries", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
