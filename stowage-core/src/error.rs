//! Error types for stowage operations

use crate::{AssetKey, RepositoryId};
use thiserror::Error;

/// Configuration errors. Raised while loading policy, before any request
/// is served.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Record store errors.
///
/// `ReadFailed` and `WriteFailed` are what a persistent `RecordStore`
/// backend reports for I/O failures; the in-memory store never fails.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Read failed for {repository}/{key}: {reason}")]
    ReadFailed {
        repository: RepositoryId,
        key: AssetKey,
        reason: String,
    },

    #[error("Write failed for {repository}/{key}: {reason}")]
    WriteFailed {
        repository: RepositoryId,
        key: AssetKey,
        reason: String,
    },

    #[error("Malformed cache attributes: {reason}")]
    MalformedAttributes { reason: String },
}

/// Outcomes of a cache decision that could not produce content.
///
/// Every variant describes a single upstream attempt. Retry scheduling is
/// owned by the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Not found: {repository}/{key} is not cached and upstream produced no content")]
    NotFound {
        repository: RepositoryId,
        key: AssetKey,
    },

    #[error("Upstream unavailable for {repository}/{key}: {reason}")]
    UpstreamUnavailable {
        repository: RepositoryId,
        key: AssetKey,
        reason: String,
    },

    #[error("{repository}/{key} was invalidated and could not be revalidated: {reason}")]
    InvalidatedButUnreachable {
        repository: RepositoryId,
        key: AssetKey,
        reason: String,
    },
}

impl CacheError {
    /// True for outcomes a caller-owned retry loop may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable { .. } | Self::InvalidatedButUnreachable { .. }
        )
    }
}

/// Master error type for all stowage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StowageError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for stowage operations.
pub type StowageResult<T> = Result<T, StowageError>;

// =============================================================================
// TESTS
// =============================================================================
