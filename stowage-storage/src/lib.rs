//! Stowage Storage - Record Store Traits and Cache Engine
//!
//! Defines the record store abstraction, an in-memory implementation, and
//! the freshness engine that decides when proxied content must be
//! revalidated against upstream.

pub mod cache;
pub mod memory;

pub use cache::{
    CacheController, CacheRead, CacheRecord, CacheStamp, CacheStats, CacheToken,
    CacheTokenRegistry, ContentFetcher, FetchError, FetchOutcome, ReadSource, RecordStore,
    Staleness, StoredContent, Validators,
};
pub use memory::InMemoryRecordStore;
