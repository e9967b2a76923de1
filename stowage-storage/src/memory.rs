//! In-memory record store.
//!
//! Backs tests and single-node deployments that do not need persistence.
//! Records are held as immutable snapshots; a write replaces the entry whole.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use stowage_core::{AssetKey, RepositoryId, StorageError};

use crate::cache::{CacheRecord, RecordStore, StoredContent};

#[derive(Debug, Clone)]
struct StoredEntry {
    record: Arc<CacheRecord>,
    content: Option<StoredContent>,
}

/// Record store keeping everything in a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    entries: DashMap<(RepositoryId, AssetKey), StoredEntry>,
    writes: AtomicU64,
}

impl InMemoryRecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an asset directly, without counting it as a write.
    pub fn insert(
        &self,
        repository: impl Into<RepositoryId>,
        key: impl Into<AssetKey>,
        record: CacheRecord,
        content: StoredContent,
    ) {
        self.entries.insert(
            (repository.into(), key.into()),
            StoredEntry {
                record: Arc::new(record),
                content: Some(content),
            },
        );
    }

    /// Snapshot of the current record, shared rather than cloned.
    pub fn record(&self, repository: &RepositoryId, key: &AssetKey) -> Option<Arc<CacheRecord>> {
        self.entries
            .get(&(repository.clone(), key.clone()))
            .map(|entry| Arc::clone(&entry.record))
    }

    /// Number of `put` calls served so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of assets stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(
        &self,
        repository: &RepositoryId,
        key: &AssetKey,
    ) -> Result<Option<CacheRecord>, StorageError> {
        Ok(self.record(repository, key).map(|record| (*record).clone()))
    }

    async fn content(
        &self,
        repository: &RepositoryId,
        key: &AssetKey,
    ) -> Result<Option<StoredContent>, StorageError> {
        Ok(self
            .entries
            .get(&(repository.clone(), key.clone()))
            .and_then(|entry| entry.content.clone()))
    }

    async fn put(
        &self,
        repository: &RepositoryId,
        key: &AssetKey,
        record: CacheRecord,
        content: Option<StoredContent>,
    ) -> Result<(), StorageError> {
        let record = Arc::new(record);
        self.entries
            .entry((repository.clone(), key.clone()))
            .and_modify(|entry| {
                entry.record = Arc::clone(&record);
                if let Some(content) = content.clone() {
                    entry.content = Some(content);
                }
            })
            .or_insert_with(|| StoredEntry {
                record: Arc::clone(&record),
                content: content.clone(),
            });
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replace_if(
        &self,
        repository: &RepositoryId,
        key: &AssetKey,
        expected: Option<&CacheRecord>,
        record: CacheRecord,
        content: Option<StoredContent>,
    ) -> Result<bool, StorageError> {
        let written = match self.entries.entry((repository.clone(), key.clone())) {
            Entry::Occupied(mut entry) => {
                if expected != Some(entry.get().record.as_ref()) {
                    false
                } else {
                    let stored = entry.get_mut();
                    stored.record = Arc::new(record);
                    if let Some(content) = content {
                        stored.content = Some(content);
                    }
                    true
                }
            }
            Entry::Vacant(entry) => {
                if expected.is_some() {
                    false
                } else {
                    entry.insert(StoredEntry {
                        record: Arc::new(record),
                        content,
                    });
                    true
                }
            }
        };

        if written {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(written)
    }

    async fn remove_repository(&self, repository: &RepositoryId) -> Result<u64, StorageError> {
        let before = self.entries.len();
        self.entries.retain(|(repo, _), _| repo != repository);
        Ok((before - self.entries.len()) as u64)
    }
}
