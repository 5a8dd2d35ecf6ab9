//! Stale-while-revalidate and invalidation ordering of the result cache.
//!
//! Runs on a paused tokio clock: `advance` moves entries between the fresh,
//! stale and expired windows deterministically.

use codelingo_client::{CacheConfig, Freshness, QueryKey, ResultCache, RetryPolicy};
use codelingo_core::RequestError;
use futures_util::future::{BoxFuture, FutureExt};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STALE: Duration = Duration::from_secs(60);
const EXPIRE: Duration = Duration::from_secs(600);
const LATENCY: Duration = Duration::from_millis(100);

fn cache() -> ResultCache {
    ResultCache::new(CacheConfig::new(STALE, EXPIRE), RetryPolicy::none())
}

/// Fetcher returning `{"version": n}` for the n-th call, after `LATENCY`.
fn versioned(
    calls: Arc<AtomicU32>,
) -> impl Fn() -> BoxFuture<'static, Result<Value, RequestError>> + Send + Sync + 'static {
    move || {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            tokio::time::sleep(LATENCY).await;
            Ok(json!({ "version": n }))
        }
        .boxed()
    }
}

/// Like `versioned`, but earlier calls take longer than later ones.
fn slowing_down(
    calls: Arc<AtomicU32>,
) -> impl Fn() -> BoxFuture<'static, Result<Value, RequestError>> + Send + Sync + 'static {
    move || {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = Duration::from_millis(400u64.saturating_sub(100 * u64::from(n)).max(50));
        async move {
            tokio::time::sleep(delay).await;
            Ok(json!({ "version": n }))
        }
        .boxed()
    }
}

fn key() -> QueryKey {
    QueryKey::new(["courses", "list"])
}

#[tokio::test(start_paused = true)]
async fn test_fresh_read_skips_network() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));

    cache.get(&key(), versioned(calls.clone())).await.unwrap();
    tokio::time::advance(STALE - Duration::from_secs(1)).await;
    let read = cache.get(&key(), versioned(calls.clone())).await.unwrap();

    assert_eq!(read.freshness(), Freshness::Fresh);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().hits, 1);
    assert_eq!(cache.stats().misses, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_read_returns_old_payload_and_revalidates_once() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));

    cache.get(&key(), versioned(calls.clone())).await.unwrap();
    tokio::time::advance(STALE + Duration::from_secs(1)).await;

    let first = cache.get(&key(), versioned(calls.clone())).await.unwrap();
    let second = cache.get(&key(), versioned(calls.clone())).await.unwrap();
    assert_eq!(first.freshness(), Freshness::Stale);
    assert_eq!(first.value(), &json!({"version": 1}));
    assert_eq!(second.value(), &json!({"version": 1}));

    // Let the background revalidation finish.
    tokio::time::sleep(LATENCY * 2).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.stats().revalidations, 1);

    let after = cache.get(&key(), versioned(calls.clone())).await.unwrap();
    assert_eq!(after.freshness(), Freshness::Fresh);
    assert_eq!(after.value(), &json!({"version": 2}));
}

#[tokio::test(start_paused = true)]
async fn test_failed_revalidation_keeps_stale_entry() {
    let cache = cache();
    cache.set(&key(), json!({"version": 1}));
    tokio::time::advance(STALE + Duration::from_secs(1)).await;

    let read = cache
        .get(&key(), || async {
            Err(RequestError::NetworkUnreachable {
                reason: "offline".to_string(),
            })
        })
        .await
        .unwrap();
    assert!(read.is_stale());
    tokio::task::yield_now().await;
    tokio::time::sleep(LATENCY).await;

    let peeked = cache.peek(&key()).unwrap();
    assert_eq!(peeked.value(), &json!({"version": 1}));

    // The flag was cleared, so the next stale read revalidates again.
    let calls = Arc::new(AtomicU32::new(0));
    cache.get(&key(), versioned(calls.clone())).await.unwrap();
    tokio::time::sleep(LATENCY * 2).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().revalidations, 2);
}

#[tokio::test(start_paused = true)]
async fn test_expired_read_waits_for_fresh_fetch() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));

    cache.get(&key(), versioned(calls.clone())).await.unwrap();
    tokio::time::advance(EXPIRE + Duration::from_secs(1)).await;
    assert!(cache.peek(&key()).is_none());

    let read = cache.get(&key(), versioned(calls.clone())).await.unwrap();
    assert_eq!(read.freshness(), Freshness::Fetched);
    assert_eq!(read.value(), &json!({"version": 2}));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_misses_share_one_fetch() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));

    let key = key();
    let reads = futures_util::future::join_all(
        (0..6).map(|_| cache.get(&key, versioned(calls.clone()))),
    )
    .await;

    assert!(reads.iter().all(|r| r.as_ref().unwrap().value() == &json!({"version": 1})));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_beats_in_flight_revalidation() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));

    cache.get(&key(), versioned(calls.clone())).await.unwrap();
    tokio::time::advance(STALE + Duration::from_secs(1)).await;

    // Starts revalidation #2 in the background.
    let stale = cache.get(&key(), versioned(calls.clone())).await.unwrap();
    assert!(stale.is_stale());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    cache.invalidate(&key());
    let read = cache.get(&key(), versioned(calls.clone())).await.unwrap();
    assert_eq!(read.freshness(), Freshness::Fetched);
    assert_eq!(read.value(), &json!({"version": 3}));

    tokio::time::sleep(LATENCY * 2).await;
    assert_eq!(cache.peek(&key()).unwrap().value(), &json!({"version": 3}));
    assert!(cache.stats().discarded >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_older_fetch_never_overwrites_newer() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));

    // Fetch #1 takes 300ms.
    let slow = {
        let cache = cache.clone();
        let fetch = slowing_down(calls.clone());
        tokio::spawn(async move {
            let key = key();
            cache.get(&key, fetch).await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Fetch #2 starts after the invalidation and takes 200ms.
    cache.invalidate(&key());
    let newer = cache.get(&key(), slowing_down(calls.clone())).await.unwrap();
    assert_eq!(newer.value(), &json!({"version": 2}));

    // The slow caller still gets its own result, but it is not committed.
    let older = slow.await.unwrap().unwrap();
    assert_eq!(older.value(), &json!({"version": 1}));
    assert_eq!(cache.peek(&key()).unwrap().value(), &json!({"version": 2}));
    assert_eq!(cache.stats().discarded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_prefix_invalidation_forces_refetch() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));
    let detail = QueryKey::new(["courses", "detail", "42"]);
    let progress = QueryKey::new(["progress", "overview"]);

    cache.get(&key(), versioned(calls.clone())).await.unwrap();
    cache.get(&detail, versioned(calls.clone())).await.unwrap();
    cache.get(&progress, versioned(calls.clone())).await.unwrap();

    assert_eq!(cache.invalidate_prefix(&QueryKey::new(["courses"])), 2);
    assert!(cache.peek(&progress).is_some());

    let read = cache.get(&detail, versioned(calls.clone())).await.unwrap();
    assert_eq!(read.freshness(), Freshness::Fetched);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

proptest! {
    #[test]
    fn prop_child_keys_start_with_parent(
        segments in codelingo_test_utils::generators::arb_key_segments(),
        extra in "[a-z]{1,8}",
    ) {
        let parent = QueryKey::new(segments.clone());
        let child = parent.child(extra.clone());
        prop_assert!(child.starts_with(&parent));
        prop_assert!(!parent.starts_with(&child));
        prop_assert_eq!(child.to_string(), format!("{}/{}", segments.join("/"), extra));
    }
}
