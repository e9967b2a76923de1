//! Stowage Test Utilities
//!
//! Centralized test infrastructure for the stowage workspace:
//! - Proptest generators for ids, records and policies
//! - A scripted upstream fetcher with call counting and gating
//! - Test fixtures for common scenarios
//! - Custom assertions for cache outcomes

pub use stowage_core::{
    AssetKey, CacheConfig, CacheError, CachePolicy, ContentKind, MaxAge, RepositoryId,
    StowageError, StowageResult, Timestamp,
};
pub use stowage_storage::{
    CacheController, CacheRead, CacheRecord, CacheToken, CacheTokenRegistry, ContentFetcher,
    FetchError, FetchOutcome, InMemoryRecordStore, ReadSource, RecordStore, StoredContent,
    Validators,
};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// MOCK FETCHER
// ============================================================================

/// Upstream stand-in for tests.
///
/// Answers from a script of queued outcomes, falling back to a default once
/// the script runs out. A gated fetcher holds every call until
/// [`MockFetcher::release`], which lets tests pile concurrent callers onto
/// one in-flight fetch.
pub struct MockFetcher {
    script: Mutex<VecDeque<Result<FetchOutcome, FetchError>>>,
    default: Result<FetchOutcome, FetchError>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Option<Validators>>>,
    gate: watch::Sender<bool>,
}

impl MockFetcher {
    pub fn new(default: Result<FetchOutcome, FetchError>) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            script: Mutex::new(VecDeque::new()),
            default,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            gate,
        }
    }

    /// Upstream always reports the cached copy as current.
    pub fn unchanged() -> Self {
        Self::new(Ok(FetchOutcome::Unchanged))
    }

    /// Upstream always returns these bytes.
    pub fn serving(bytes: &[u8]) -> Self {
        Self::new(Ok(FetchOutcome::new_content(
            bytes.to_vec(),
            Validators::default(),
        )))
    }

    /// Upstream always fails with `error`.
    pub fn failing(error: FetchError) -> Self {
        Self::new(Err(error))
    }

    /// Upstream is unreachable.
    pub fn unreachable() -> Self {
        Self::failing(FetchError::Unreachable {
            reason: "connection refused".to_string(),
        })
    }

    /// Queue an outcome for the next unanswered call.
    pub fn then(self, outcome: Result<FetchOutcome, FetchError>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
        self
    }

    /// Hold every call until [`release`](Self::release).
    pub fn gated(self) -> Self {
        self.gate.send_replace(false);
        self
    }

    /// Open the gate for all held and future calls.
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Number of fetches issued so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Validators passed to each call, in call order.
    pub fn validators_seen(&self) -> Vec<Option<Validators>> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ContentFetcher for MockFetcher {
    async fn fetch(
        &self,
        _repository: &RepositoryId,
        _key: &AssetKey,
        validators: Option<&Validators>,
    ) -> Result<FetchOutcome, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(validators.cloned());

        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(FetchError::Unreachable {
                reason: "mock fetcher dropped".to_string(),
            });
        }

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        scripted.unwrap_or_else(|| self.default.clone())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating stowage types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a repository name.
    pub fn arb_repository_id() -> impl Strategy<Value = RepositoryId> {
        "[a-z][a-z0-9-]{0,15}".prop_map(RepositoryId::from)
    }

    /// Generate an asset path.
    pub fn arb_asset_key() -> impl Strategy<Value = AssetKey> {
        prop::collection::vec("[a-z0-9._-]{1,12}", 1..6).prop_map(|segments| {
            AssetKey::from(segments.join("/"))
        })
    }

    /// Generate a Timestamp within a reasonable range (2020-2030).
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    /// Generate a record with any stamp.
    pub fn arb_cache_record() -> impl Strategy<Value = CacheRecord> {
        (
            arb_timestamp(),
            prop_oneof![
                Just(None),
                Just(Some(stowage_storage::cache::INVALIDATED.to_string())),
                "[a-f0-9]{8}".prop_map(Some),
            ],
        )
            .prop_map(|(at, token)| CacheRecord::new(at, token))
    }

    /// Generate a MaxAge variant.
    pub fn arb_max_age() -> impl Strategy<Value = MaxAge> {
        prop_oneof![
            Just(MaxAge::AlwaysRevalidate),
            Just(MaxAge::Unbounded),
            (1u64..30 * 86400).prop_map(|s| MaxAge::Bounded(Duration::from_secs(s))),
        ]
    }

    /// Generate a CachePolicy.
    pub fn arb_cache_policy() -> impl Strategy<Value = CachePolicy> {
        (arb_max_age(), any::<bool>())
            .prop_map(|(max_age, allow)| CachePolicy::new(max_age).with_stale_on_error(allow))
    }

    /// Generate a ContentKind variant.
    pub fn arb_content_kind() -> impl Strategy<Value = ContentKind> {
        prop_oneof![Just(ContentKind::Content), Just(ContentKind::Metadata)]
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    /// Controller type used throughout the tests.
    pub type TestController = CacheController<InMemoryRecordStore, MockFetcher>;

    /// Repository used by fixtures.
    pub fn repo() -> RepositoryId {
        RepositoryId::from("maven-central")
    }

    /// Asset key used by fixtures.
    pub fn key() -> AssetKey {
        AssetKey::from("org/acme/widget/1.0/widget-1.0.jar")
    }

    /// Bytes seeded into the cache by [`seed`].
    pub const CACHED_BYTES: &[u8] = b"cached widget bytes";

    /// Config with a one hour content TTL and a short fetch timeout.
    pub fn hour_config(allow_stale_on_error: bool) -> CacheConfig {
        CacheConfig::new()
            .with_fetch_timeout(Duration::from_secs(5))
            .with_default_policy(
                ContentKind::Content,
                CachePolicy::max_age(Duration::from_secs(3600))
                    .with_stale_on_error(allow_stale_on_error),
            )
    }

    /// Build a controller over an empty in-memory store.
    pub fn controller(fetcher: MockFetcher, config: CacheConfig) -> (Arc<TestController>, Arc<MockFetcher>) {
        let fetcher = Arc::new(fetcher);
        let controller = CacheController::new(
            Arc::new(CacheTokenRegistry::new()),
            Arc::new(InMemoryRecordStore::new()),
            Arc::clone(&fetcher),
            config,
        )
        .unwrap_or_else(|e| panic!("fixture config must validate: {}", e));
        (Arc::new(controller), fetcher)
    }

    /// Seed [`repo`]/[`key`] with a record verified `age_secs` ago under the
    /// repository's current token.
    pub fn seed(controller: &TestController, age_secs: i64) -> CacheRecord {
        let token = controller.registry().current_token(&repo());
        let record = CacheRecord::verified(Utc::now() - chrono::Duration::seconds(age_secs), token);
        seed_record(controller, record.clone());
        record
    }

    /// Seed [`repo`]/[`key`] with an explicit record.
    pub fn seed_record(controller: &TestController, record: CacheRecord) {
        controller.store().insert(
            repo(),
            key(),
            record,
            StoredContent::new(
                CACHED_BYTES.to_vec(),
                Validators::new(Some("\"v1\"".to_string()), None),
            ),
        );
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for cache outcomes.

    use super::*;

    /// Assert that a read was served from cache.
    #[track_caller]
    pub fn assert_cache_hit(result: &StowageResult<CacheRead>) {
        match result {
            Ok(read) if read.was_cache_hit() => {}
            other => panic!("Expected cache hit, got: {:?}", other),
        }
    }

    /// Assert that a read came from the given source.
    #[track_caller]
    pub fn assert_source(result: &StowageResult<CacheRead>, source: ReadSource) {
        match result {
            Ok(read) if read.source() == source => {}
            other => panic!("Expected read from {:?}, got: {:?}", source, other),
        }
    }

    /// Assert that a read failed with NotFound.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &StowageResult<T>) {
        match result {
            Err(StowageError::Cache(CacheError::NotFound { .. })) => {}
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }

    /// Assert that a read failed with UpstreamUnavailable.
    #[track_caller]
    pub fn assert_upstream_unavailable<T: std::fmt::Debug>(result: &StowageResult<T>) {
        match result {
            Err(StowageError::Cache(CacheError::UpstreamUnavailable { .. })) => {}
            other => panic!("Expected UpstreamUnavailable, got: {:?}", other),
        }
    }

    /// Assert that a read failed with InvalidatedButUnreachable.
    #[track_caller]
    pub fn assert_invalidated_but_unreachable<T: std::fmt::Debug>(result: &StowageResult<T>) {
        match result {
            Err(StowageError::Cache(CacheError::InvalidatedButUnreachable { .. })) => {}
            other => panic!("Expected InvalidatedButUnreachable, got: {:?}", other),
        }
    }
}
