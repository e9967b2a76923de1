//! Per-repository cache generations.
//!
//! Every repository owns one current [`CacheToken`]. Records remember the
//! token that was current when they were verified; rotating the token makes
//! every older record stale the next time it is read, without touching any
//! of them. That is what makes "invalidate everything" O(1).

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use stowage_core::RepositoryId;

use super::record::CacheToken;

/// Table of current tokens keyed by repository.
///
/// Tokens are immutable values swapped in whole under a short write lock, so
/// a reader sees either the previous token or the new one.
#[derive(Debug, Default)]
pub struct CacheTokenRegistry {
    tokens: RwLock<HashMap<RepositoryId, CacheToken>>,
}

impl CacheTokenRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repository and issue its initial token.
    ///
    /// Registering an existing repository keeps its current token.
    pub fn create_repository(&self, repository: &RepositoryId) -> CacheToken {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        tokens
            .entry(repository.clone())
            .or_insert_with(CacheToken::generate)
            .clone()
    }

    /// Drop a repository's token. Returns the token that was current.
    pub fn remove_repository(&self, repository: &RepositoryId) -> Option<CacheToken> {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        tokens.remove(repository)
    }

    /// The live token for a repository.
    ///
    /// A repository seen for the first time gets its initial token here.
    pub fn current_token(&self, repository: &RepositoryId) -> CacheToken {
        {
            let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(token) = tokens.get(repository) {
                return token.clone();
            }
        }
        self.create_repository(repository)
    }

    /// Issue a new token for the repository and publish it.
    pub fn rotate(&self, repository: &RepositoryId) -> CacheToken {
        let token = CacheToken::generate();
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        tokens.insert(repository.clone(), token.clone());
        token
    }

    /// Whether the repository currently has a token.
    pub fn contains(&self, repository: &RepositoryId) -> bool {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(repository)
    }

    /// Number of registered repositories.
    pub fn len(&self) -> usize {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
