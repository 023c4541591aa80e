//! Revoked-token list
//!
//! Replicated so that every gateway can reject a revoked client token
//! without asking the primary.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Cluster-wide list of revoked client tokens
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TokenList {
    /// Monotonically increasing list version
    pub version: u64,
    /// Revoked tokens
    pub tokens: Vec<String>,
}

impl TokenList {
    /// Record a revocation and bump the version
    pub fn revoke(&mut self, token: impl Into<String>) {
        self.tokens.push(token.into());
        self.version += 1;
    }

    #[must_use]
    pub fn is_revoked(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }
}

/// Holder of the local revoked-token replica
#[derive(Default)]
pub struct TokenOwner {
    cur: RwLock<Arc<TokenList>>,
    update_mu: Mutex<()>,
}

impl TokenOwner {
    pub fn get(&self) -> Arc<TokenList> {
        self.cur.read().clone()
    }

    /// Commit a received list only if it is newer than the published one;
    /// the comparison happens under the update token, so a replica
    /// validated against a stale snapshot cannot regress the version
    pub fn put_if_newer(&self, list: TokenList) -> Option<Arc<TokenList>> {
        let _token = self.update_mu.lock();
        if list.version <= self.cur.read().version {
            return None;
        }
        let committed = Arc::new(list);
        *self.cur.write() = committed.clone();
        Some(committed)
    }

    /// Clone-mutate-swap under the update token
    pub fn modify<F>(&self, f: F) -> Arc<TokenList>
    where
        F: FnOnce(&mut TokenList),
    {
        let _token = self.update_mu.lock();
        let mut draft = (**self.cur.read()).clone();
        f(&mut draft);
        let committed = Arc::new(draft);
        *self.cur.write() = committed.clone();
        committed
    }
}
