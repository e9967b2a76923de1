//! The cache freshness decision engine.
//!
//! [`CacheController`] decides whether a cached asset can be served as-is
//! and, when it cannot, runs a single coalesced upstream revalidation and
//! publishes the resulting record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stowage_core::{
    content_hash_hex, AssetKey, CacheConfig, CacheError, CachePolicy, ConfigError, ContentKind,
    RepositoryId, StorageError, StowageResult,
};
use tracing::{debug, info, warn};

use super::coalesce::Coalescer;
use super::freshness::{classify, CacheRead, Staleness};
use super::record::{CacheRecord, CacheToken};
use super::stats::{CacheStats, StatsRecorder};
use super::token::CacheTokenRegistry;
use super::traits::{ContentFetcher, FetchError, FetchOutcome, RecordStore, StoredContent};

type FlightKey = (RepositoryId, AssetKey);

/// Record and bytes read together before a decision.
///
/// A record with no stored bytes is kept so a publish can compare against
/// it, but it is never servable.
#[derive(Debug, Clone)]
struct Snapshot {
    record: CacheRecord,
    content: Option<StoredContent>,
}

impl Snapshot {
    fn servable(&self) -> Option<(&CacheRecord, &StoredContent)> {
        self.content.as_ref().map(|content| (&self.record, content))
    }
}

/// Decision engine for cached proxy content.
///
/// Built once with its collaborators and handed to the serving layer.
///
/// # Type Parameters
///
/// - `S`: The record store holding records and cached bytes
/// - `F`: The fetcher performing single upstream attempts
pub struct CacheController<S, F>
where
    S: RecordStore + 'static,
    F: ContentFetcher + 'static,
{
    registry: Arc<CacheTokenRegistry>,
    store: Arc<S>,
    fetcher: Arc<F>,
    config: CacheConfig,
    coalescer: Coalescer<FlightKey, StowageResult<CacheRead>>,
    stats: Arc<StatsRecorder>,
}

impl<S, F> CacheController<S, F>
where
    S: RecordStore + 'static,
    F: ContentFetcher + 'static,
{
    /// Create a controller. Fails if the configuration does not validate.
    pub fn new(
        registry: Arc<CacheTokenRegistry>,
        store: Arc<S>,
        fetcher: Arc<F>,
        config: CacheConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            registry,
            store,
            fetcher,
            config,
            coalescer: Coalescer::new(),
            stats: Arc::new(StatsRecorder::default()),
        })
    }

    /// Get the token registry.
    pub fn registry(&self) -> &CacheTokenRegistry {
        &self.registry
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get a reference to the record store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Snapshot of the engine counters.
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Number of revalidations currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.coalescer.inflight_count()
    }

    /// The policy in effect for a repository and content kind.
    pub fn policy_for(&self, repository: &RepositoryId, kind: ContentKind) -> CachePolicy {
        self.config.policy_for(repository, kind)
    }

    /// The record a successful verification would publish right now.
    pub fn current(&self, repository: &RepositoryId) -> CacheRecord {
        CacheRecord::verified(Utc::now(), self.registry.current_token(repository))
    }

    /// Classify a record against the repository's current token.
    pub fn classify(
        &self,
        record: Option<&CacheRecord>,
        repository: &RepositoryId,
        policy: &CachePolicy,
    ) -> Staleness {
        let current = self.registry.current_token(repository);
        classify(record, &current, policy, Utc::now())
    }

    /// Whether a record must be revalidated before it is served.
    pub fn is_stale(
        &self,
        record: Option<&CacheRecord>,
        repository: &RepositoryId,
        policy: &CachePolicy,
    ) -> bool {
        self.classify(record, repository, policy).is_stale()
    }

    /// Serve an asset: from cache when fresh, otherwise through a single
    /// coalesced revalidation.
    pub async fn get(
        &self,
        repository: &RepositoryId,
        key: &AssetKey,
        kind: ContentKind,
    ) -> StowageResult<CacheRead> {
        let policy = self.policy_for(repository, kind);
        let snapshot = self.load(repository, key).await?;
        let servable = snapshot.as_ref().and_then(Snapshot::servable);
        let staleness = self.classify(servable.map(|(record, _)| record), repository, &policy);

        if let (Staleness::Fresh, Some((record, content))) = (staleness, servable) {
            self.stats.hit();
            debug!(repository = %repository, key = %key, "serving fresh cached content");
            return Ok(CacheRead::from_cache(content.clone(), record.clone()));
        }

        self.stats.miss();
        debug!(
            repository = %repository,
            key = %key,
            staleness = %staleness,
            "cached content needs revalidation"
        );
        self.revalidate_snapshot(repository, key, policy, snapshot)
            .await
    }

    /// Revalidate an asset against upstream regardless of its staleness.
    pub async fn revalidate(
        &self,
        repository: &RepositoryId,
        key: &AssetKey,
        kind: ContentKind,
    ) -> StowageResult<CacheRead> {
        let policy = self.policy_for(repository, kind);
        let snapshot = self.load(repository, key).await?;
        self.revalidate_snapshot(repository, key, policy, snapshot)
            .await
    }

    /// Mark one asset invalidated. Visible to the very next read.
    ///
    /// Returns `false` when nothing is cached for the key.
    pub async fn invalidate_one(
        &self,
        repository: &RepositoryId,
        key: &AssetKey,
    ) -> StowageResult<bool> {
        if self.store.get(repository, key).await?.is_none() {
            debug!(repository = %repository, key = %key, "nothing cached to invalidate");
            return Ok(false);
        }

        self.store
            .put(repository, key, CacheRecord::invalidated(Utc::now()), None)
            .await?;
        info!(repository = %repository, key = %key, "invalidated cached asset");
        Ok(true)
    }

    /// Invalidate every cached asset of a repository by rotating its token.
    ///
    /// No record is read or written; each one is found stale when next read.
    pub fn invalidate_all(&self, repository: &RepositoryId) -> CacheToken {
        let token = self.registry.rotate(repository);
        info!(repository = %repository, token = %token, "rotated cache token");
        token
    }

    /// Register a repository with the token registry.
    pub fn create_repository(&self, repository: &RepositoryId) -> CacheToken {
        self.registry.create_repository(repository)
    }

    /// Forget a repository: drop its token and its records.
    pub async fn remove_repository(&self, repository: &RepositoryId) -> StowageResult<u64> {
        self.registry.remove_repository(repository);
        let removed = self.store.remove_repository(repository).await?;
        info!(repository = %repository, removed, "removed repository cache state");
        Ok(removed)
    }

    async fn load(
        &self,
        repository: &RepositoryId,
        key: &AssetKey,
    ) -> Result<Option<Snapshot>, StorageError> {
        let Some(record) = self.store.get(repository, key).await? else {
            return Ok(None);
        };
        let content = self.store.content(repository, key).await?;
        Ok(Some(Snapshot { record, content }))
    }

    async fn revalidate_snapshot(
        &self,
        repository: &RepositoryId,
        key: &AssetKey,
        policy: CachePolicy,
        snapshot: Option<Snapshot>,
    ) -> StowageResult<CacheRead> {
        let timeout = self.config.fetch_timeout;
        let abort_key = (repository.clone(), key.clone());

        let flight = self.coalescer.join(
            (repository.clone(), key.clone()),
            || {
                Revalidation {
                    store: Arc::clone(&self.store),
                    fetcher: Arc::clone(&self.fetcher),
                    stats: Arc::clone(&self.stats),
                    repository: repository.clone(),
                    key: key.clone(),
                    policy,
                    snapshot: snapshot.clone(),
                    token: self.registry.current_token(repository),
                    timeout,
                }
                .run()
            },
            move |reason| {
                Err(CacheError::UpstreamUnavailable {
                    repository: abort_key.0,
                    key: abort_key.1,
                    reason: format!("revalidation task aborted: {}", reason),
                }
                .into())
            },
        );

        if !flight.is_leader() {
            self.stats.coalesced();
            debug!(repository = %repository, key = %key, "attached to in-flight revalidation");
        }

        let outcome = match flight.wait(timeout).await {
            Some(outcome) => outcome,
            None => {
                warn!(
                    repository = %repository,
                    key = %key,
                    timeout_ms = timeout.as_millis() as u64,
                    "gave up waiting for in-flight revalidation"
                );
                resolve_failure(repository, key, &policy, snapshot, &FetchError::TimedOut)
            }
        };

        // Counted per caller so a shared fallback and a timed out waiter
        // never count the same read twice.
        if matches!(&outcome, Ok(read) if read.is_stale()) {
            self.stats.stale_served();
        }
        outcome
    }
}

/// One upstream attempt and the publish that follows it. Runs detached
/// from the callers waiting on it.
struct Revalidation<S, F> {
    store: Arc<S>,
    fetcher: Arc<F>,
    stats: Arc<StatsRecorder>,
    repository: RepositoryId,
    key: AssetKey,
    policy: CachePolicy,
    snapshot: Option<Snapshot>,
    /// Token current when the flight started. A rotation that lands while
    /// the fetch is outstanding leaves the new record stale.
    token: CacheToken,
    timeout: Duration,
}

impl<S, F> Revalidation<S, F>
where
    S: RecordStore + 'static,
    F: ContentFetcher + 'static,
{
    async fn run(self) -> StowageResult<CacheRead> {
        self.stats.revalidation();
        let validators = self
            .snapshot
            .as_ref()
            .and_then(|snapshot| snapshot.content.as_ref())
            .map(|content| content.validators().clone());

        let fetched = tokio::time::timeout(
            self.timeout,
            self.fetcher
                .fetch(&self.repository, &self.key, validators.as_ref()),
        )
        .await
        .unwrap_or(Err(FetchError::TimedOut));

        match fetched {
            Ok(FetchOutcome::Unchanged) => {
                let cached = self
                    .snapshot
                    .as_ref()
                    .and_then(|snapshot| snapshot.content.clone());
                let Some(content) = cached else {
                    warn!(
                        repository = %self.repository,
                        key = %self.key,
                        "upstream reported unchanged but nothing is cached"
                    );
                    return Err(CacheError::NotFound {
                        repository: self.repository,
                        key: self.key,
                    }
                    .into());
                };

                let record = CacheRecord::verified(Utc::now(), self.token.clone());
                if self.publish(&record, None).await? {
                    info!(
                        repository = %self.repository,
                        key = %self.key,
                        "upstream confirmed cached content"
                    );
                }
                Ok(CacheRead::revalidated(content, record))
            }
            Ok(FetchOutcome::NewContent { bytes, validators }) => {
                let content = StoredContent::new(bytes, validators);
                let record = CacheRecord::verified(Utc::now(), self.token.clone());
                if self.publish(&record, Some(content.clone())).await? {
                    info!(
                        repository = %self.repository,
                        key = %self.key,
                        bytes = content.len(),
                        sha256 = %content_hash_hex(content.hash()),
                        "cached new upstream content"
                    );
                }
                Ok(CacheRead::from_upstream(content, record))
            }
            Err(error) => {
                self.stats.upstream_failure();
                warn!(
                    repository = %self.repository,
                    key = %self.key,
                    error = %error,
                    "upstream revalidation failed"
                );
                resolve_failure(&self.repository, &self.key, &self.policy, self.snapshot, &error)
            }
        }
    }

    /// Store the verified record unless the record this flight started from
    /// was replaced in the meantime, e.g. by an explicit invalidation.
    /// Returns whether the store took the write.
    async fn publish(
        &self,
        record: &CacheRecord,
        content: Option<StoredContent>,
    ) -> Result<bool, StorageError> {
        let expected = self.snapshot.as_ref().map(|snapshot| &snapshot.record);
        let published = self
            .store
            .replace_if(&self.repository, &self.key, expected, record.clone(), content)
            .await?;
        if !published {
            info!(
                repository = %self.repository,
                key = %self.key,
                "record changed during revalidation; keeping the newer record"
            );
        }
        Ok(published)
    }
}

/// Decide what a failed upstream attempt means for the caller.
///
/// The previous content is only ever served when the policy allows it;
/// otherwise the failure surfaces, and an explicitly invalidated asset
/// reports that distinctly.
fn resolve_failure(
    repository: &RepositoryId,
    key: &AssetKey,
    policy: &CachePolicy,
    snapshot: Option<Snapshot>,
    error: &FetchError,
) -> StowageResult<CacheRead> {
    let Some(Snapshot {
        record,
        content: Some(content),
    }) = snapshot
    else {
        return Err(CacheError::NotFound {
            repository: repository.clone(),
            key: key.clone(),
        }
        .into());
    };

    if policy.allow_stale_on_error {
        warn!(
            repository = %repository,
            key = %key,
            error = %error,
            "serving stale content after upstream failure"
        );
        return Ok(CacheRead::stale_fallback(
            content,
            record,
            format!("served stale content: {}", error),
        ));
    }

    let reason = error.to_string();
    if record.is_invalidated() {
        Err(CacheError::InvalidatedButUnreachable {
            repository: repository.clone(),
            key: key.clone(),
            reason,
        }
        .into())
    } else {
        Err(CacheError::UpstreamUnavailable {
            repository: repository.clone(),
            key: key.clone(),
            reason,
        }
        .into())
    }
}
