//! Staleness classification and read results.
//!
//! [`classify`] is the pure decision: given a record, the repository's
//! current token and a policy, it says whether the record may be served.
//! It never performs I/O.

use std::fmt;
use std::time::Duration;

use stowage_core::{CachePolicy, Timestamp};

use super::record::{CacheRecord, CacheStamp, CacheToken};
use super::traits::StoredContent;

/// Why a record is (or is not) servable. First matching rule wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    /// Verified recently enough under the current generation.
    Fresh,
    /// Nothing cached.
    Missing,
    /// Individually invalidated.
    Invalidated,
    /// Verified under a generation that has since been rotated.
    TokenRotated,
    /// Older than the policy's max age.
    Expired { age: Duration },
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Self::Fresh)
    }
}

impl fmt::Display for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => f.write_str("fresh"),
            Self::Missing => f.write_str("missing"),
            Self::Invalidated => f.write_str("invalidated"),
            Self::TokenRotated => f.write_str("token rotated"),
            Self::Expired { age } => write!(f, "expired (age {}s)", age.as_secs()),
        }
    }
}

/// Classify a record.
///
/// 1. no record: stale
/// 2. invalidated: stale, whatever its age
/// 3. token present and different from `current`: stale
/// 4. otherwise stale iff `age > max_age`
pub fn classify(
    record: Option<&CacheRecord>,
    current: &CacheToken,
    policy: &CachePolicy,
    now: Timestamp,
) -> Staleness {
    let Some(record) = record else {
        return Staleness::Missing;
    };

    match record.stamp() {
        CacheStamp::Invalidated => return Staleness::Invalidated,
        CacheStamp::Token(token) if token != current => return Staleness::TokenRotated,
        CacheStamp::Token(_) | CacheStamp::Untracked => {}
    }

    let age = record.age(now);
    if policy.max_age.is_expired(age) {
        Staleness::Expired { age }
    } else {
        Staleness::Fresh
    }
}

/// Where the content of a [`CacheRead`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Served from cache without contacting upstream.
    Cache,
    /// Upstream confirmed the cached bytes; record refreshed.
    Revalidated,
    /// Upstream returned new bytes, now cached.
    Upstream,
    /// Upstream failed and policy allowed serving the stale bytes.
    StaleFallback,
}

/// Result of a serving request.
///
/// Carries the content together with the record in effect and how the
/// answer was obtained, so callers can see when they got stale data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRead {
    content: StoredContent,
    record: CacheRecord,
    source: ReadSource,
    warning: Option<String>,
}

impl CacheRead {
    /// A fresh cache hit.
    pub fn from_cache(content: StoredContent, record: CacheRecord) -> Self {
        Self {
            content,
            record,
            source: ReadSource::Cache,
            warning: None,
        }
    }

    /// Cached bytes confirmed by upstream under a new record.
    pub fn revalidated(content: StoredContent, record: CacheRecord) -> Self {
        Self {
            content,
            record,
            source: ReadSource::Revalidated,
            warning: None,
        }
    }

    /// New bytes from upstream.
    pub fn from_upstream(content: StoredContent, record: CacheRecord) -> Self {
        Self {
            content,
            record,
            source: ReadSource::Upstream,
            warning: None,
        }
    }

    /// Previous bytes served because revalidation failed.
    pub fn stale_fallback(
        content: StoredContent,
        record: CacheRecord,
        warning: impl Into<String>,
    ) -> Self {
        Self {
            content,
            record,
            source: ReadSource::StaleFallback,
            warning: Some(warning.into()),
        }
    }

    pub fn content(&self) -> &StoredContent {
        &self.content
    }

    pub fn bytes(&self) -> &[u8] {
        self.content.bytes()
    }

    /// The record in effect after this read.
    pub fn record(&self) -> &CacheRecord {
        &self.record
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    /// Soft warning attached to a stale fallback.
    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    /// Check if upstream was not contacted.
    pub fn was_cache_hit(&self) -> bool {
        self.source == ReadSource::Cache
    }

    /// Check if the served bytes are known to be stale.
    pub fn is_stale(&self) -> bool {
        self.source == ReadSource::StaleFallback
    }
}
