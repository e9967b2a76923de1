//! Stowage Core - Data Types
//!
//! Identity types, the error hierarchy and freshness policy configuration
//! shared by every stowage crate. No engine behavior lives here.

pub mod config;
pub mod error;
pub mod identity;

pub use config::{
    CacheConfig, CachePolicy, KindPolicies, MaxAge, PolicyOverrides, RepositoryConfig,
    DEFAULT_CONTENT_MAX_AGE, DEFAULT_FETCH_TIMEOUT, DEFAULT_METADATA_MAX_AGE,
};
pub use error::{CacheError, ConfigError, StorageError, StowageError, StowageResult};
pub use identity::{
    compute_content_hash, content_hash_hex, AssetKey, ContentHash, ContentKind, Format,
    RepositoryId, Timestamp,
};
