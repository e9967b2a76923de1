//! Freshness policy configuration
//!
//! Policies are resolved per request from three layers: a repository
//! override, the defaults for the repository's format, and the global
//! defaults. Each layer may set separate policies for content and metadata.
//!
//! Everything here is validated at load time. A negative TTL or a zero
//! fetch timeout is a [`ConfigError`] and the engine never starts with it.

use crate::{ConfigError, ContentKind, Format, RepositoryId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default content max age (24 hours).
pub const DEFAULT_CONTENT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Default metadata max age (30 minutes).
pub const DEFAULT_METADATA_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// Default single-attempt upstream fetch timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const UNBOUNDED: &str = "unbounded";
const ALWAYS_REVALIDATE: &str = "always-revalidate";

// ============================================================================
// MAX AGE
// ============================================================================

/// How long a verified record stays fresh by age alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawMaxAge", into = "RawMaxAge")]
pub enum MaxAge {
    /// Every read revalidates (a configured TTL of zero).
    AlwaysRevalidate,
    /// Fresh while `age <= duration`.
    Bounded(Duration),
    /// Never expires by age; only invalidation makes it stale.
    Unbounded,
}

impl MaxAge {
    /// Build from a TTL in seconds. Zero means always revalidate.
    pub fn from_seconds(seconds: i64) -> Result<Self, ConfigError> {
        match seconds {
            s if s < 0 => Err(ConfigError::InvalidValue {
                field: "max_age".to_string(),
                value: s.to_string(),
                reason: "max_age must not be negative; use \"unbounded\" to never expire"
                    .to_string(),
            }),
            0 => Ok(Self::AlwaysRevalidate),
            s => Ok(Self::Bounded(Duration::from_secs(s as u64))),
        }
    }

    /// Parse either an integer number of seconds or one of the sentinels
    /// `unbounded` / `always-revalidate`.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let trimmed = value.trim();
        match trimmed {
            UNBOUNDED => Ok(Self::Unbounded),
            ALWAYS_REVALIDATE => Ok(Self::AlwaysRevalidate),
            other => {
                let seconds = other.parse::<i64>().map_err(|_| ConfigError::InvalidValue {
                    field: "max_age".to_string(),
                    value: other.to_string(),
                    reason: format!(
                        "expected seconds, \"{}\" or \"{}\"",
                        UNBOUNDED, ALWAYS_REVALIDATE
                    ),
                })?;
                Self::from_seconds(seconds)
            }
        }
    }

    /// Max ages are configured and persisted in whole seconds.
    fn check_granularity(&self) -> Result<(), ConfigError> {
        match self {
            Self::Bounded(d) if d.subsec_nanos() != 0 => Err(ConfigError::InvalidValue {
                field: "max_age".to_string(),
                value: format!("{:?}", d),
                reason: "max_age must be a whole number of seconds".to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Whether a record of the given age has outlived this policy.
    pub fn is_expired(&self, age: Duration) -> bool {
        match self {
            Self::AlwaysRevalidate => true,
            Self::Bounded(max) if max.is_zero() => true,
            Self::Bounded(max) => age > *max,
            Self::Unbounded => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawMaxAge {
    Seconds(i64),
    Named(String),
}

impl TryFrom<RawMaxAge> for MaxAge {
    type Error = ConfigError;

    fn try_from(raw: RawMaxAge) -> Result<Self, Self::Error> {
        match raw {
            RawMaxAge::Seconds(s) => MaxAge::from_seconds(s),
            RawMaxAge::Named(name) => MaxAge::parse(&name),
        }
    }
}

impl From<MaxAge> for RawMaxAge {
    fn from(max_age: MaxAge) -> Self {
        match max_age {
            MaxAge::AlwaysRevalidate => RawMaxAge::Named(ALWAYS_REVALIDATE.to_string()),
            MaxAge::Bounded(d) => RawMaxAge::Seconds(d.as_secs() as i64),
            MaxAge::Unbounded => RawMaxAge::Named(UNBOUNDED.to_string()),
        }
    }
}

// ============================================================================
// POLICIES
// ============================================================================

/// Freshness policy for one kind of asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub max_age: MaxAge,
    /// Serve the previous content when revalidation fails upstream.
    #[serde(default)]
    pub allow_stale_on_error: bool,
}

impl CachePolicy {
    pub fn new(max_age: MaxAge) -> Self {
        Self {
            max_age,
            allow_stale_on_error: false,
        }
    }

    /// Policy with a bounded TTL.
    pub fn max_age(max_age: Duration) -> Self {
        Self::new(MaxAge::Bounded(max_age))
    }

    pub fn always_revalidate() -> Self {
        Self::new(MaxAge::AlwaysRevalidate)
    }

    pub fn unbounded() -> Self {
        Self::new(MaxAge::Unbounded)
    }

    /// Enable or disable serving stale content on upstream failure.
    pub fn with_stale_on_error(mut self, allow: bool) -> Self {
        self.allow_stale_on_error = allow;
        self
    }
}

/// A policy for each [`ContentKind`]. A kind left out of a config file
/// keeps its built-in default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindPolicies {
    #[serde(default = "default_content_policy")]
    pub content: CachePolicy,
    #[serde(default = "default_metadata_policy")]
    pub metadata: CachePolicy,
}

fn default_content_policy() -> CachePolicy {
    CachePolicy::max_age(DEFAULT_CONTENT_MAX_AGE)
}

fn default_metadata_policy() -> CachePolicy {
    CachePolicy::max_age(DEFAULT_METADATA_MAX_AGE)
}

impl KindPolicies {
    pub fn for_kind(&self, kind: ContentKind) -> CachePolicy {
        match kind {
            ContentKind::Content => self.content,
            ContentKind::Metadata => self.metadata,
        }
    }

    fn set(&mut self, kind: ContentKind, policy: CachePolicy) {
        match kind {
            ContentKind::Content => self.content = policy,
            ContentKind::Metadata => self.metadata = policy,
        }
    }
}

impl Default for KindPolicies {
    fn default() -> Self {
        Self {
            content: default_content_policy(),
            metadata: default_metadata_policy(),
        }
    }
}

/// Partial per-kind overrides for a format or repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverrides {
    #[serde(default)]
    pub content: Option<CachePolicy>,
    #[serde(default)]
    pub metadata: Option<CachePolicy>,
}

impl PolicyOverrides {
    pub fn for_kind(&self, kind: ContentKind) -> Option<CachePolicy> {
        match kind {
            ContentKind::Content => self.content,
            ContentKind::Metadata => self.metadata,
        }
    }
}

/// Per-repository configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Format of the repository; selects the format-level defaults.
    #[serde(default)]
    pub format: Option<Format>,
    #[serde(default)]
    pub content: Option<CachePolicy>,
    #[serde(default)]
    pub metadata: Option<CachePolicy>,
}

impl RepositoryConfig {
    pub fn for_format(format: impl Into<Format>) -> Self {
        Self {
            format: Some(format.into()),
            ..Default::default()
        }
    }

    fn override_for(&self, kind: ContentKind) -> Option<CachePolicy> {
        match kind {
            ContentKind::Content => self.content,
            ContentKind::Metadata => self.metadata,
        }
    }
}

// ============================================================================
// CACHE CONFIG
// ============================================================================

/// Top-level configuration of the freshness engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Timeout for one upstream fetch attempt. Coalesced waiters are bounded
    /// by the same value.
    #[serde(with = "duration_secs", default = "default_fetch_timeout")]
    pub fetch_timeout: Duration,

    /// Global defaults.
    #[serde(default)]
    pub default: KindPolicies,

    /// Format-level defaults keyed by format name.
    #[serde(default)]
    pub formats: HashMap<Format, PolicyOverrides>,

    /// Repository-level overrides keyed by repository name.
    #[serde(default)]
    pub repositories: HashMap<RepositoryId, RepositoryConfig>,
}

fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            default: KindPolicies::default(),
            formats: HashMap::new(),
            repositories: HashMap::new(),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set the global default policy for one kind.
    pub fn with_default_policy(mut self, kind: ContentKind, policy: CachePolicy) -> Self {
        self.default.set(kind, policy);
        self
    }

    /// Set a format-level policy for one kind.
    pub fn with_format_policy(
        mut self,
        format: impl Into<Format>,
        kind: ContentKind,
        policy: CachePolicy,
    ) -> Self {
        let entry = self.formats.entry(format.into()).or_default();
        match kind {
            ContentKind::Content => entry.content = Some(policy),
            ContentKind::Metadata => entry.metadata = Some(policy),
        }
        self
    }

    /// Register a repository configuration.
    pub fn with_repository(
        mut self,
        repository: impl Into<RepositoryId>,
        config: RepositoryConfig,
    ) -> Self {
        self.repositories.insert(repository.into(), config);
        self
    }

    /// Resolve the policy in effect for a repository and content kind.
    ///
    /// Repository override wins over the format default, which wins over the
    /// global default.
    pub fn policy_for(&self, repository: &RepositoryId, kind: ContentKind) -> CachePolicy {
        let repo = self.repositories.get(repository);

        if let Some(policy) = repo.and_then(|r| r.override_for(kind)) {
            return policy;
        }

        repo.and_then(|r| r.format.as_ref())
            .and_then(|format| self.formats.get(format))
            .and_then(|overrides| overrides.for_kind(kind))
            .unwrap_or_else(|| self.default.for_kind(kind))
    }

    /// Validate the configuration.
    ///
    /// Max ages are already range-checked during parsing; this covers the
    /// invariants that span fields and values built in code.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "fetch_timeout".to_string(),
                value: format!("{:?}", self.fetch_timeout),
                reason: "fetch_timeout must be positive".to_string(),
            });
        }

        for policy in self.policies() {
            policy.max_age.check_granularity()?;
        }

        for (name, repo) in &self.repositories {
            if name.as_str().trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "repositories".to_string(),
                    value: format!("{:?}", repo),
                    reason: "repository name must not be empty".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Every policy set at any layer.
    fn policies(&self) -> impl Iterator<Item = &CachePolicy> {
        let defaults = [&self.default.content, &self.default.metadata];
        let formats = self
            .formats
            .values()
            .flat_map(|o| o.content.iter().chain(o.metadata.iter()));
        let repositories = self
            .repositories
            .values()
            .flat_map(|r| r.content.iter().chain(r.metadata.iter()));
        defaults.into_iter().chain(formats).chain(repositories)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay the process environment onto this configuration.
    ///
    /// Environment variables:
    /// - `STOWAGE_FETCH_TIMEOUT_SECS`: Upstream fetch timeout in seconds
    /// - `STOWAGE_CONTENT_MAX_AGE`: Global content max age (seconds or sentinel)
    /// - `STOWAGE_METADATA_MAX_AGE`: Global metadata max age (seconds or sentinel)
    /// - `STOWAGE_ALLOW_STALE_ON_ERROR`: "true" or "false" for both kinds
    pub fn from_env(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Overlay variables from an arbitrary lookup. `from_env` delegates here.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("STOWAGE_FETCH_TIMEOUT_SECS") {
            let secs = raw.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                field: "STOWAGE_FETCH_TIMEOUT_SECS".to_string(),
                value: raw.clone(),
                reason: "expected a whole number of seconds".to_string(),
            })?;
            self.fetch_timeout = Duration::from_secs(secs);
        }

        if let Some(raw) = lookup("STOWAGE_CONTENT_MAX_AGE") {
            self.default.content.max_age = MaxAge::parse(&raw)?;
        }

        if let Some(raw) = lookup("STOWAGE_METADATA_MAX_AGE") {
            self.default.metadata.max_age = MaxAge::parse(&raw)?;
        }

        if let Some(raw) = lookup("STOWAGE_ALLOW_STALE_ON_ERROR") {
            let allow = match raw.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        field: "STOWAGE_ALLOW_STALE_ON_ERROR".to_string(),
                        value: raw,
                        reason: "expected true or false".to_string(),
                    })
                }
            };
            self.default.content.allow_stale_on_error = allow;
            self.default.metadata.allow_stale_on_error = allow;
        }

        self.validate()?;
        Ok(self)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

// =============================================================================
// TESTS
// =============================================================================
