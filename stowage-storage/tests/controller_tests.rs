//! End-to-end behaviour of the cache controller over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stowage_core::{CacheConfig, CachePolicy, ContentKind, MaxAge};
use stowage_storage::{FetchError, FetchOutcome, ReadSource, RecordStore, Staleness, Validators};
use stowage_test_utils::assertions::*;
use stowage_test_utils::fixtures::{self, key, repo, seed, CACHED_BYTES};
use stowage_test_utils::MockFetcher;

/// Poll until `condition` holds or a second has passed.
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

// ============================================================================
// FRESHNESS SCENARIOS
// ============================================================================

#[tokio::test]
async fn fresh_record_is_served_without_upstream_call() {
    let (controller, fetcher) = fixtures::controller(MockFetcher::unchanged(), fixtures::hour_config(false));
    let record = seed(&controller, 1800);
    let policy = controller.policy_for(&repo(), ContentKind::Content);

    assert!(!controller.is_stale(Some(&record), &repo(), &policy));

    let result = controller.get(&repo(), &key(), ContentKind::Content).await;
    assert_cache_hit(&result);
    assert_eq!(result.unwrap().bytes(), CACHED_BYTES);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn expired_record_confirmed_unchanged_is_refreshed() {
    let (controller, fetcher) = fixtures::controller(MockFetcher::unchanged(), fixtures::hour_config(false));
    let original = seed(&controller, 7200);
    let before = Utc::now();

    let read = controller
        .get(&repo(), &key(), ContentKind::Content)
        .await
        .unwrap();

    assert_eq!(read.source(), ReadSource::Revalidated);
    assert_eq!(read.bytes(), CACHED_BYTES);
    assert!(read.record().last_verified() >= before);
    assert_eq!(read.record().token(), original.token());
    assert_eq!(fetcher.calls(), 1);

    let stored = controller.store().get(&repo(), &key()).await.unwrap().unwrap();
    assert_eq!(&stored, read.record());
    let bytes = controller.store().content(&repo(), &key()).await.unwrap().unwrap();
    assert_eq!(bytes.bytes(), CACHED_BYTES);
}

#[tokio::test]
async fn conditional_fetch_carries_cached_validators() {
    let (controller, fetcher) = fixtures::controller(MockFetcher::unchanged(), fixtures::hour_config(false));
    seed(&controller, 7200);

    controller
        .get(&repo(), &key(), ContentKind::Content)
        .await
        .unwrap();

    let seen = fetcher.validators_seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0],
        Some(Validators::new(Some("\"v1\"".to_string()), None))
    );
}

#[tokio::test]
async fn invalidate_one_makes_fresh_record_stale() {
    let (controller, _fetcher) = fixtures::controller(MockFetcher::unchanged(), fixtures::hour_config(false));
    seed(&controller, 0);
    let policy = controller.policy_for(&repo(), ContentKind::Content);

    assert!(controller.invalidate_one(&repo(), &key()).await.unwrap());

    let record = controller.store().get(&repo(), &key()).await.unwrap();
    assert!(record.as_ref().unwrap().is_invalidated());
    assert_eq!(
        controller.classify(record.as_ref(), &repo(), &policy),
        Staleness::Invalidated
    );
}

#[tokio::test]
async fn invalidated_asset_is_revalidated_on_next_read() {
    let (controller, fetcher) = fixtures::controller(
        MockFetcher::serving(b"republished"),
        fixtures::hour_config(false),
    );
    seed(&controller, 0);
    controller.invalidate_one(&repo(), &key()).await.unwrap();

    let read = controller
        .get(&repo(), &key(), ContentKind::Content)
        .await
        .unwrap();

    assert_eq!(read.source(), ReadSource::Upstream);
    assert_eq!(read.bytes(), b"republished");
    assert!(!read.record().is_invalidated());
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn upstream_failure_without_fallback_fails() {
    let (controller, _fetcher) = fixtures::controller(MockFetcher::unreachable(), fixtures::hour_config(false));
    let original = seed(&controller, 7200);

    let result = controller.get(&repo(), &key(), ContentKind::Content).await;

    assert_upstream_unavailable(&result);
    assert_eq!(
        controller.store().get(&repo(), &key()).await.unwrap(),
        Some(original)
    );
    assert_eq!(controller.store().write_count(), 0);
}

#[tokio::test]
async fn upstream_failure_with_fallback_serves_previous_content() {
    let (controller, _fetcher) = fixtures::controller(MockFetcher::unreachable(), fixtures::hour_config(true));
    let original = seed(&controller, 7200);

    let result = controller.get(&repo(), &key(), ContentKind::Content).await;

    assert_source(&result, ReadSource::StaleFallback);
    let read = result.unwrap();
    assert_eq!(read.bytes(), CACHED_BYTES);
    assert_eq!(read.record(), &original);
    assert!(read.warning().is_some());
    assert_eq!(
        controller.store().get(&repo(), &key()).await.unwrap(),
        Some(original)
    );
    assert_eq!(controller.store().write_count(), 0);
    assert_eq!(controller.stats().stale_served, 1);
}

#[tokio::test]
async fn invalidated_and_unreachable_is_reported_distinctly() {
    let (controller, _fetcher) = fixtures::controller(MockFetcher::unreachable(), fixtures::hour_config(false));
    seed(&controller, 0);
    controller.invalidate_one(&repo(), &key()).await.unwrap();

    let result = controller.get(&repo(), &key(), ContentKind::Content).await;
    assert_invalidated_but_unreachable(&result);
}

#[tokio::test]
async fn nothing_cached_and_upstream_missing_is_not_found() {
    let (controller, _fetcher) = fixtures::controller(
        MockFetcher::failing(FetchError::Missing),
        fixtures::hour_config(true),
    );

    let result = controller.get(&repo(), &key(), ContentKind::Content).await;
    assert_not_found(&result);
}

#[tokio::test]
async fn first_read_populates_cache() {
    let (controller, fetcher) = fixtures::controller(
        MockFetcher::serving(b"first"),
        fixtures::hour_config(false),
    );

    let first = controller
        .get(&repo(), &key(), ContentKind::Content)
        .await
        .unwrap();
    let second = controller.get(&repo(), &key(), ContentKind::Content).await;

    assert_eq!(first.source(), ReadSource::Upstream);
    assert_cache_hit(&second);
    assert_eq!(fetcher.calls(), 1);
}

// ============================================================================
// POLICIES
// ============================================================================

#[tokio::test]
async fn metadata_and_content_follow_their_own_policies() {
    let config = fixtures::hour_config(false)
        .with_default_policy(ContentKind::Metadata, CachePolicy::always_revalidate());
    let (controller, fetcher) = fixtures::controller(MockFetcher::unchanged(), config);
    seed(&controller, 0);

    let content = controller.get(&repo(), &key(), ContentKind::Content).await;
    assert_cache_hit(&content);
    assert_eq!(fetcher.calls(), 0);

    let metadata = controller.get(&repo(), &key(), ContentKind::Metadata).await;
    assert_source(&metadata, ReadSource::Revalidated);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn unbounded_policy_never_expires() {
    let config = CacheConfig::new()
        .with_default_policy(ContentKind::Content, CachePolicy::new(MaxAge::Unbounded));
    let (controller, fetcher) = fixtures::controller(MockFetcher::unchanged(), config);
    seed(&controller, 10 * 365 * 86400);

    let result = controller.get(&repo(), &key(), ContentKind::Content).await;
    assert_cache_hit(&result);
    assert_eq!(fetcher.calls(), 0);
}

// ============================================================================
// GENERATIONS
// ============================================================================

#[tokio::test]
async fn invalidate_all_rotates_without_touching_records() {
    let (controller, fetcher) = fixtures::controller(MockFetcher::unchanged(), fixtures::hour_config(false));
    let record = seed(&controller, 0);
    let policy = controller.policy_for(&repo(), ContentKind::Content);
    let old_token = controller.registry().current_token(&repo());

    let new_token = controller.invalidate_all(&repo());

    assert_ne!(old_token, new_token);
    assert_eq!(controller.store().write_count(), 0);
    let stored = controller.store().get(&repo(), &key()).await.unwrap();
    assert_eq!(stored.as_ref(), Some(&record));
    assert_eq!(
        controller.classify(stored.as_ref(), &repo(), &policy),
        Staleness::TokenRotated
    );

    let read = controller
        .get(&repo(), &key(), ContentKind::Content)
        .await
        .unwrap();
    assert_eq!(read.record().token(), Some(&new_token));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn invalidate_all_leaves_other_repositories_alone() {
    let (controller, _fetcher) = fixtures::controller(MockFetcher::unchanged(), fixtures::hour_config(false));
    let record = seed(&controller, 0);
    let policy = controller.policy_for(&repo(), ContentKind::Content);

    controller.invalidate_all(&"npm-proxy".into());

    assert!(!controller.is_stale(Some(&record), &repo(), &policy));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rotation_during_fetch_leaves_new_record_stale() {
    let (controller, fetcher) = fixtures::controller(
        MockFetcher::unchanged().gated(),
        fixtures::hour_config(false),
    );
    seed(&controller, 7200);
    let policy = controller.policy_for(&repo(), ContentKind::Content);

    let pending = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.get(&repo(), &key(), ContentKind::Content).await })
    };
    assert!(eventually(|| fetcher.calls() == 1).await);

    controller.invalidate_all(&repo());
    fetcher.release();
    pending.await.unwrap().unwrap();

    let stored = controller.store().get(&repo(), &key()).await.unwrap();
    assert_eq!(
        controller.classify(stored.as_ref(), &repo(), &policy),
        Staleness::TokenRotated
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalidation_during_fetch_is_not_overwritten() {
    let (controller, fetcher) = fixtures::controller(
        MockFetcher::unchanged().gated(),
        fixtures::hour_config(false),
    );
    seed(&controller, 7200);
    let policy = controller.policy_for(&repo(), ContentKind::Content);

    let pending = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.get(&repo(), &key(), ContentKind::Content).await })
    };
    assert!(eventually(|| fetcher.calls() == 1).await);

    assert!(controller.invalidate_one(&repo(), &key()).await.unwrap());
    fetcher.release();
    let read = pending.await.unwrap().unwrap();
    assert_eq!(read.bytes(), CACHED_BYTES);

    let stored = controller.store().get(&repo(), &key()).await.unwrap();
    assert!(stored.as_ref().unwrap().is_invalidated());
    assert_eq!(
        controller.classify(stored.as_ref(), &repo(), &policy),
        Staleness::Invalidated
    );

    controller
        .get(&repo(), &key(), ContentKind::Content)
        .await
        .unwrap();
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_content_fetched_before_invalidation_is_not_stored() {
    let (controller, fetcher) = fixtures::controller(
        MockFetcher::serving(b"pre-invalidation").gated(),
        fixtures::hour_config(false),
    );
    seed(&controller, 7200);

    let pending = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.get(&repo(), &key(), ContentKind::Content).await })
    };
    assert!(eventually(|| fetcher.calls() == 1).await);

    controller.invalidate_one(&repo(), &key()).await.unwrap();
    fetcher.release();
    pending.await.unwrap().unwrap();

    let stored = controller.store().get(&repo(), &key()).await.unwrap().unwrap();
    assert!(stored.is_invalidated());
    let bytes = controller.store().content(&repo(), &key()).await.unwrap().unwrap();
    assert_eq!(bytes.bytes(), CACHED_BYTES);
    assert_eq!(controller.store().write_count(), 1);
}

// ============================================================================
// COALESCING
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_stale_reads_share_one_fetch() {
    const CALLERS: usize = 50;

    let (controller, fetcher) = fixtures::controller(
        MockFetcher::serving(b"fresh from upstream").gated(),
        fixtures::hour_config(false),
    );
    seed(&controller, 7200);

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.get(&repo(), &key(), ContentKind::Content).await })
        })
        .collect();

    assert!(eventually(|| controller.stats().coalesced == (CALLERS - 1) as u64).await);
    assert_eq!(controller.inflight_count(), 1);
    fetcher.release();

    let mut outcomes = Vec::with_capacity(CALLERS);
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    assert_eq!(fetcher.calls(), 1);
    let first = outcomes[0].as_ref().unwrap();
    assert_eq!(first.bytes(), b"fresh from upstream");
    assert!(outcomes.iter().all(|outcome| outcome.as_ref() == Ok(first)));
    assert_eq!(controller.store().write_count(), 1);
    assert!(eventually(|| controller.inflight_count() == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_share_one_outcome() {
    const CALLERS: usize = 20;

    let (controller, fetcher) = fixtures::controller(
        MockFetcher::unreachable().gated(),
        fixtures::hour_config(false),
    );
    seed(&controller, 7200);

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.get(&repo(), &key(), ContentKind::Content).await })
        })
        .collect();

    assert!(eventually(|| controller.stats().coalesced == (CALLERS - 1) as u64).await);
    fetcher.release();

    for handle in handles {
        assert_upstream_unavailable(&handle.await.unwrap());
    }
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(controller.stats().upstream_failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_stale_fallback_counts_each_caller_once() {
    const CALLERS: usize = 10;

    let (controller, fetcher) = fixtures::controller(
        MockFetcher::unreachable().gated(),
        fixtures::hour_config(true),
    );
    seed(&controller, 7200);

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.get(&repo(), &key(), ContentKind::Content).await })
        })
        .collect();

    assert!(eventually(|| controller.stats().coalesced == (CALLERS - 1) as u64).await);
    fetcher.release();

    for handle in handles {
        assert_source(&handle.await.unwrap(), ReadSource::StaleFallback);
    }
    assert_eq!(controller.stats().stale_served, CALLERS as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timed_out_stale_fallback_is_counted_once() {
    let config = fixtures::hour_config(true).with_fetch_timeout(Duration::from_millis(50));
    let (controller, _fetcher) = fixtures::controller(MockFetcher::unchanged().gated(), config);
    seed(&controller, 7200);

    let result = controller.get(&repo(), &key(), ContentKind::Content).await;

    assert_source(&result, ReadSource::StaleFallback);
    assert!(eventually(|| controller.inflight_count() == 0).await);
    assert_eq!(controller.stats().stale_served, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completed_flight_does_not_absorb_later_reads() {
    let (controller, fetcher) = fixtures::controller(
        MockFetcher::unreachable().then(Ok(FetchOutcome::Unchanged)),
        fixtures::hour_config(false),
    );
    seed(&controller, 7200);

    let first = controller.get(&repo(), &key(), ContentKind::Content).await;
    assert_source(&first, ReadSource::Revalidated);

    // The failure default only applies once the script is used up.
    let second = controller.get(&repo(), &key(), ContentKind::Content).await;
    assert_cache_hit(&second);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_caller_does_not_cancel_fetch() {
    let (controller, fetcher) = fixtures::controller(
        MockFetcher::serving(b"late").gated(),
        fixtures::hour_config(false),
    );
    seed(&controller, 7200);

    let caller = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.get(&repo(), &key(), ContentKind::Content).await })
    };
    assert!(eventually(|| fetcher.calls() == 1).await);

    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());
    fetcher.release();

    let store_written = eventually(|| controller.store().write_count() == 1).await;
    assert!(store_written);
    let bytes = controller.store().content(&repo(), &key()).await.unwrap().unwrap();
    assert_eq!(bytes.bytes(), b"late");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_upstream_times_out_as_failure() {
    let config = fixtures::hour_config(false).with_fetch_timeout(Duration::from_millis(50));
    let (controller, _fetcher) = fixtures::controller(MockFetcher::unchanged().gated(), config);
    let original = seed(&controller, 7200);

    let result = controller.get(&repo(), &key(), ContentKind::Content).await;

    assert_upstream_unavailable(&result);
    assert_eq!(
        controller.store().get(&repo(), &key()).await.unwrap(),
        Some(original)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_upstream_with_fallback_serves_stale() {
    let config = fixtures::hour_config(true).with_fetch_timeout(Duration::from_millis(50));
    let (controller, _fetcher) = fixtures::controller(MockFetcher::unchanged().gated(), config);
    seed(&controller, 7200);

    let result = controller.get(&repo(), &key(), ContentKind::Content).await;
    assert_source(&result, ReadSource::StaleFallback);
}

// ============================================================================
// REPOSITORY LIFECYCLE
// ============================================================================

#[tokio::test]
async fn removed_repository_starts_a_new_generation() {
    let (controller, _fetcher) = fixtures::controller(MockFetcher::unchanged(), fixtures::hour_config(false));
    let record = seed(&controller, 0);
    let policy = controller.policy_for(&repo(), ContentKind::Content);

    assert_eq!(controller.remove_repository(&repo()).await.unwrap(), 1);
    controller.create_repository(&repo());

    assert!(controller.store().is_empty());
    assert!(controller.is_stale(Some(&record), &repo(), &policy));
}
