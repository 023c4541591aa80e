//! Bucket catalog metadata
//!
//! The bucket catalog is one of the replicated artifacts: the primary
//! gateway owns the authoritative copy and metasyncs every change.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-bucket properties
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketProps {
    /// Whether object versioning is enabled for the bucket
    pub versioning: bool,
}

/// Cluster-wide bucket catalog
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BucketMd {
    /// Monotonically increasing catalog version
    pub version: u64,
    /// Buckets by name
    pub buckets: HashMap<String, BucketProps>,
}

impl BucketMd {
    /// Add a bucket; returns false (no version bump) when it already exists
    pub fn add(&mut self, name: impl Into<String>, props: BucketProps) -> bool {
        let name = name.into();
        if self.buckets.contains_key(&name) {
            return false;
        }
        self.buckets.insert(name, props);
        self.version += 1;
        true
    }

    /// Remove a bucket; returns false (no version bump) when absent
    pub fn remove(&mut self, name: &str) -> bool {
        if self.buckets.remove(name).is_none() {
            return false;
        }
        self.version += 1;
        true
    }
}

/// Holder of the local bucket-catalog replica; readers get pointer-swap
/// snapshots, writers serialize on an update token so no two of them can
/// publish the same version with different contents.
#[derive(Default)]
pub struct BmdOwner {
    cur: RwLock<Arc<BucketMd>>,
    update_mu: Mutex<()>,
}

impl BmdOwner {
    pub fn new(initial: BucketMd) -> Self {
        Self {
            cur: RwLock::new(Arc::new(initial)),
            update_mu: Mutex::new(()),
        }
    }

    /// Current snapshot
    pub fn get(&self) -> Arc<BucketMd> {
        self.cur.read().clone()
    }

    /// Commit a received catalog only if it is newer than the published
    /// one; the comparison happens under the update token, so a replica
    /// validated against a stale snapshot cannot regress the version
    pub fn put_if_newer(&self, bmd: BucketMd) -> Option<Arc<BucketMd>> {
        let _token = self.update_mu.lock();
        if bmd.version <= self.cur.read().version {
            return None;
        }
        let committed = Arc::new(bmd);
        *self.cur.write() = committed.clone();
        Some(committed)
    }

    /// Clone-mutate-swap under the update token; returns the committed
    /// catalog, or `None` when the mutation declined to change anything
    pub fn modify<F>(&self, f: F) -> Option<Arc<BucketMd>>
    where
        F: FnOnce(&mut BucketMd) -> bool,
    {
        let _token = self.update_mu.lock();
        let mut draft = (**self.cur.read()).clone();
        if !f(&mut draft) {
            return None;
        }
        let committed = Arc::new(draft);
        *self.cur.write() = committed.clone();
        Some(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_bumps_on_change_only() {
        let mut bmd = BucketMd::default();
        assert!(bmd.add("logs", BucketProps::default()));
        assert_eq!(bmd.version, 1);
        assert!(!bmd.add("logs", BucketProps::default()));
        assert_eq!(bmd.version, 1);
        assert!(bmd.remove("logs"));
        assert_eq!(bmd.version, 2);
        assert!(!bmd.remove("logs"));
        assert_eq!(bmd.version, 2);
    }

    #[test]
    fn test_owner_snapshot_isolation() {
        let owner = BmdOwner::default();
        let before = owner.get();
        let mut next = (*before).clone();
        next.add("media", BucketProps { versioning: true });
        assert!(owner.put_if_newer(next).is_some());
        assert_eq!(before.version, 0);
        assert_eq!(owner.get().version, 1);
    }

    #[test]
    fn test_put_if_newer_never_regresses() {
        let owner = BmdOwner::default();
        let mut v2 = BucketMd::default();
        v2.add("a", BucketProps::default());
        v2.add("b", BucketProps::default());
        assert!(owner.put_if_newer(v2).is_some());
        assert_eq!(owner.get().version, 2);

        // an older replica validated against a stale snapshot is dropped
        let mut v1 = BucketMd::default();
        v1.add("a", BucketProps::default());
        assert!(owner.put_if_newer(v1).is_none());
        // and so is a same-version duplicate
        let same = (*owner.get()).clone();
        assert!(owner.put_if_newer(same).is_none());
        assert_eq!(owner.get().version, 2);
        assert!(owner.get().buckets.contains_key("b"));
    }

    #[test]
    fn test_modify_commits_only_on_change() {
        let owner = BmdOwner::default();
        let committed = owner
            .modify(|bmd| bmd.add("logs", BucketProps::default()))
            .unwrap();
        assert_eq!(committed.version, 1);

        // adding a duplicate declines the change; nothing is published
        assert!(owner
            .modify(|bmd| bmd.add("logs", BucketProps::default()))
            .is_none());
        assert_eq!(owner.get().version, 1);
    }
}
