//! Per-key deduplication of concurrent async work.
//!
//! The first caller for a key starts the work; callers arriving while it
//! is running await the same shared future and receive a clone of its
//! output. A finished flight is removed, so the next call starts anew.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

type Flight<T> = Shared<BoxFuture<'static, T>>;

pub struct SingleFlight<K, T>
where
    T: Clone,
{
    flights: Mutex<HashMap<K, (u64, Flight<T>)>>,
    next_id: AtomicU64,
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, (u64, Flight<T>)>> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the flight for `key`, or start one with `start`.
    ///
    /// `start` is only invoked when no flight is running for the key.
    pub async fn run<F>(&self, key: K, start: F) -> T
    where
        F: FnOnce() -> BoxFuture<'static, T>,
    {
        let (id, flight) = {
            let mut flights = self.lock();
            match flights.get(&key) {
                Some((id, flight)) => {
                    tracing::trace!(flight = id, "joining in-flight call");
                    (*id, flight.clone())
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let flight = start().shared();
                    flights.insert(key.clone(), (id, flight.clone()));
                    (id, flight)
                }
            }
        };

        let output = flight.await;
        self.finish(&key, id);
        output
    }

    fn finish(&self, key: &K, id: u64) {
        let mut flights = self.lock();
        if flights.get(key).is_some_and(|(current, _)| *current == id) {
            flights.remove(key);
        }
    }

    /// Detach the running flight for `key`. Its current waiters still get
    /// its result; the next `run` starts a new flight.
    pub fn forget(&self, key: &K) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn forget_all(&self) {
        self.lock().clear();
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::time::Duration;

    fn counted(calls: Arc<AtomicU32>, value: u32) -> BoxFuture<'static, u32> {
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            value
        }
        .boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_flight() {
        let group = SingleFlight::<&'static str, u32>::new();
        let calls = Arc::new(AtomicU32::new(0));

        let results = futures_util::future::join_all((0..5).map(|i| {
            let calls = calls.clone();
            let group = &group;
            async move { group.run("key", move || counted(calls, i)).await }
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Everyone receives the leader's value.
        assert!(results.iter().all(|v| *v == 0));
        assert!(group.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_calls_start_new_flights() {
        let group = SingleFlight::<&'static str, u32>::new();
        let calls = Arc::new(AtomicU32::new(0));

        assert_eq!(group.run("key", || counted(calls.clone(), 1)).await, 1);
        assert_eq!(group.run("key", || counted(calls.clone(), 2)).await, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_do_not_share() {
        let group = SingleFlight::<&'static str, u32>::new();
        let calls = Arc::new(AtomicU32::new(0));

        let (a, b) = tokio::join!(
            group.run("a", || counted(calls.clone(), 1)),
            group.run("b", || counted(calls.clone(), 2)),
        );
        assert_eq!((a, b), (1, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_detaches_running_flight() {
        let group = Arc::new(SingleFlight::<&'static str, u32>::new());
        let calls = Arc::new(AtomicU32::new(0));

        let first = {
            let group = group.clone();
            let calls = calls.clone();
            tokio::spawn(async move { group.run("key", || counted(calls, 1)).await })
        };
        tokio::task::yield_now().await;
        assert!(group.is_in_flight(&"key"));

        assert!(group.forget(&"key"));
        let second = group.run("key", || counted(calls.clone(), 2)).await;

        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(group.is_empty());
    }
}
