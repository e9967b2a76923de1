//! Collaborator traits: where records live and how upstream is reached.
//!
//! The engine owns neither. A [`RecordStore`] persists records and content
//! with whatever transaction semantics its backend has; a [`ContentFetcher`]
//! performs exactly one conditional upstream request per call.

use std::sync::Arc;

use async_trait::async_trait;
use stowage_core::{compute_content_hash, AssetKey, ContentHash, RepositoryId, StorageError, Timestamp};
use thiserror::Error;

use super::record::CacheRecord;

/// Validators used to make an upstream request conditional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    /// Entity tag returned by upstream.
    pub etag: Option<String>,
    /// Last-Modified returned by upstream.
    pub last_modified: Option<Timestamp>,
}

impl Validators {
    pub fn new(etag: Option<String>, last_modified: Option<Timestamp>) -> Self {
        Self {
            etag,
            last_modified,
        }
    }

    /// Whether a conditional request can be made with these validators.
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Cached bytes plus what upstream told us about them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContent {
    bytes: Arc<[u8]>,
    validators: Validators,
    hash: ContentHash,
}

impl StoredContent {
    pub fn new(bytes: impl Into<Arc<[u8]>>, validators: Validators) -> Self {
        let bytes = bytes.into();
        let hash = compute_content_hash(&bytes);
        Self {
            bytes,
            validators,
            hash,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn validators(&self) -> &Validators {
        &self.validators
    }

    /// SHA-256 of the bytes, computed once at construction.
    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Storage for cache records and their content.
///
/// One current record per `(repository, key)`. Reads hand out snapshots;
/// writes replace the previous record whole.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Get the current record for an asset.
    async fn get(
        &self,
        repository: &RepositoryId,
        key: &AssetKey,
    ) -> Result<Option<CacheRecord>, StorageError>;

    /// Get the cached content for an asset.
    async fn content(
        &self,
        repository: &RepositoryId,
        key: &AssetKey,
    ) -> Result<Option<StoredContent>, StorageError>;

    /// Replace the record for an asset.
    ///
    /// `content` of `None` keeps whatever bytes are already stored.
    async fn put(
        &self,
        repository: &RepositoryId,
        key: &AssetKey,
        record: CacheRecord,
        content: Option<StoredContent>,
    ) -> Result<(), StorageError>;

    /// Replace the record only if the current one still equals `expected`,
    /// where `None` means no record at all. Returns whether the write
    /// happened.
    ///
    /// The compare and the write must be atomic with respect to `put` on the
    /// same asset.
    async fn replace_if(
        &self,
        repository: &RepositoryId,
        key: &AssetKey,
        expected: Option<&CacheRecord>,
        record: CacheRecord,
        content: Option<StoredContent>,
    ) -> Result<bool, StorageError>;

    /// Drop every record of a repository. Returns how many were removed.
    async fn remove_repository(&self, repository: &RepositoryId) -> Result<u64, StorageError>;
}

/// Why a single upstream attempt produced no usable answer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("upstream unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("upstream returned status {status}")]
    Status { status: u16 },

    #[error("upstream does not have the requested asset")]
    Missing,

    #[error("upstream fetch timed out")]
    TimedOut,
}

/// Result of one conditional upstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Upstream confirmed the cached content is current.
    Unchanged,
    /// Upstream returned different content.
    NewContent {
        bytes: Arc<[u8]>,
        validators: Validators,
    },
}

impl FetchOutcome {
    pub fn new_content(bytes: impl Into<Arc<[u8]>>, validators: Validators) -> Self {
        Self::NewContent {
            bytes: bytes.into(),
            validators,
        }
    }
}

/// Performs a single upstream fetch attempt. Implementations must not retry.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(
        &self,
        repository: &RepositoryId,
        key: &AssetKey,
        validators: Option<&Validators>,
    ) -> Result<FetchOutcome, FetchError>;
}
