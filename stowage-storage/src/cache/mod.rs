//! Cache freshness and invalidation engine.
//!
//! Decides whether a cached proxy asset can be served as-is, must be
//! revalidated against upstream, or was forcibly invalidated.
//!
//! # Generations
//!
//! Each repository has a current [`CacheToken`] held by the
//! [`CacheTokenRegistry`]. A [`CacheRecord`] remembers the token that was
//! current when it was verified. Invalidating a whole repository is a single
//! token rotation: no record is rewritten, each is found stale the next
//! time it is read.
//!
//! # Example
//!
//! ```ignore
//! let controller = CacheController::new(registry, store, fetcher, config)?;
//!
//! // Fresh content is served without contacting upstream; stale content
//! // is revalidated once, however many callers ask for it concurrently.
//! let read = controller.get(&repository, &key, ContentKind::Content).await?;
//! if let Some(warning) = read.warning() {
//!     tracing::warn!(%warning, "served stale content");
//! }
//!
//! controller.invalidate_one(&repository, &key).await?;
//! controller.invalidate_all(&repository);
//! ```

pub mod coalesce;
pub mod controller;
pub mod freshness;
pub mod record;
pub mod stats;
pub mod token;
pub mod traits;

pub use coalesce::{Coalescer, Flight, FlightFuture};
pub use controller::CacheController;
pub use freshness::{classify, CacheRead, ReadSource, Staleness};
pub use record::{CacheRecord, CacheStamp, CacheToken, CACHE, CACHE_TOKEN, INVALIDATED, LAST_VERIFIED};
pub use stats::CacheStats;
pub use token::CacheTokenRegistry;
pub use traits::{
    ContentFetcher, FetchError, FetchOutcome, RecordStore, StoredContent, Validators,
};
