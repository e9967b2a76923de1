//! Per-asset verification metadata.
//!
//! A [`CacheRecord`] is never edited. Every verification or invalidation
//! publishes a new record that replaces the previous one.
//!
//! # Persisted form
//!
//! Record stores keep the record inside the asset's attribute map:
//!
//! ```text
//! { "cache": { "last_verified": "2024-05-01T10:00:00Z", "cache_token": "0190..." } }
//! ```
//!
//! An individually invalidated asset carries the reserved token value
//! [`INVALIDATED`]. In memory that case is its own [`CacheStamp`] variant, so
//! no token issued by the registry can be mistaken for it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use stowage_core::{StorageError, Timestamp};
use uuid::Uuid;

/// Key of the asset's nested map of cache related properties.
pub const CACHE: &str = "cache";

/// Attribute holding the cache token.
pub const CACHE_TOKEN: &str = "cache_token";

/// Attribute holding the last verified timestamp.
pub const LAST_VERIFIED: &str = "last_verified";

/// Persisted token value marking an individually invalidated asset.
pub const INVALIDATED: &str = "invalidated";

/// An opaque generation marker issued by the token registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheToken(Arc<str>);

impl CacheToken {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    /// Issue a fresh token. UUIDv7 keeps tokens unique across repository
    /// re-creation and never collides with [`INVALIDATED`].
    pub fn generate() -> Self {
        Self(Arc::from(Uuid::now_v7().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The generation state a record was stamped with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheStamp {
    /// No generation tracking; only age decides.
    Untracked,
    /// Verified under this generation.
    Token(CacheToken),
    /// Explicitly invalidated. Stale regardless of age.
    Invalidated,
}

/// Verification metadata for one cached asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RecordAttributes", into = "RecordAttributes")]
pub struct CacheRecord {
    last_verified: Timestamp,
    stamp: CacheStamp,
}

impl CacheRecord {
    /// Build a record from its persisted fields. A token equal to
    /// [`INVALIDATED`] marks the record as invalidated.
    pub fn new(last_verified: Timestamp, cache_token: Option<String>) -> Self {
        let stamp = match cache_token {
            None => CacheStamp::Untracked,
            Some(token) if token == INVALIDATED => CacheStamp::Invalidated,
            Some(token) => CacheStamp::Token(CacheToken::new(token)),
        };
        Self {
            last_verified,
            stamp,
        }
    }

    /// Record of a successful verification under `token`.
    pub fn verified(last_verified: Timestamp, token: CacheToken) -> Self {
        Self {
            last_verified,
            stamp: CacheStamp::Token(token),
        }
    }

    /// Record marking an asset as individually invalidated.
    pub fn invalidated(at: Timestamp) -> Self {
        Self {
            last_verified: at,
            stamp: CacheStamp::Invalidated,
        }
    }

    /// When this asset was last verified and detected as fresh.
    pub fn last_verified(&self) -> Timestamp {
        self.last_verified
    }

    pub fn stamp(&self) -> &CacheStamp {
        &self.stamp
    }

    /// The cache token in its persisted form.
    pub fn cache_token(&self) -> Option<&str> {
        match &self.stamp {
            CacheStamp::Untracked => None,
            CacheStamp::Token(token) => Some(token.as_str()),
            CacheStamp::Invalidated => Some(INVALIDATED),
        }
    }

    /// The registry token in effect at verification, if any.
    pub fn token(&self) -> Option<&CacheToken> {
        match &self.stamp {
            CacheStamp::Token(token) => Some(token),
            _ => None,
        }
    }

    /// Whether this asset has been individually invalidated.
    pub fn is_invalidated(&self) -> bool {
        matches!(self.stamp, CacheStamp::Invalidated)
    }

    /// Age relative to `now`. Clock skew into the future counts as zero.
    pub fn age(&self, now: Timestamp) -> Duration {
        now.signed_duration_since(self.last_verified)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Read the record from an asset attribute map.
    ///
    /// Returns `Ok(None)` when the asset carries no cache attributes.
    pub fn from_attributes(attributes: &Map<String, Value>) -> Result<Option<Self>, StorageError> {
        let Some(nested) = attributes.get(CACHE) else {
            return Ok(None);
        };

        serde_json::from_value::<RecordAttributes>(nested.clone())
            .map(|attrs| Some(attrs.into()))
            .map_err(|e| StorageError::MalformedAttributes {
                reason: e.to_string(),
            })
    }

    /// Write the record into an asset attribute map, replacing any previous
    /// cache attributes.
    pub fn apply_to(&self, attributes: &mut Map<String, Value>) {
        let mut nested = Map::new();
        nested.insert(
            LAST_VERIFIED.to_string(),
            Value::String(self.last_verified.to_rfc3339()),
        );
        if let Some(token) = self.cache_token() {
            nested.insert(CACHE_TOKEN.to_string(), Value::String(token.to_string()));
        }
        attributes.insert(CACHE.to_string(), Value::Object(nested));
    }
}

impl fmt::Display for CacheRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheRecord{{last_verified={}, cache_token={:?}}}",
            self.last_verified.to_rfc3339(),
            self.cache_token()
        )
    }
}

#[derive(Serialize, Deserialize)]
struct RecordAttributes {
    last_verified: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cache_token: Option<String>,
}

impl From<RecordAttributes> for CacheRecord {
    fn from(attrs: RecordAttributes) -> Self {
        CacheRecord::new(attrs.last_verified, attrs.cache_token)
    }
}

impl From<CacheRecord> for RecordAttributes {
    fn from(record: CacheRecord) -> Self {
        let cache_token = record.cache_token().map(str::to_string);
        RecordAttributes {
            last_verified: record.last_verified,
            cache_token,
        }
    }
}
