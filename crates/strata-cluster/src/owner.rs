//! Copy-on-write owner of the cluster map
//!
//! Readers take pointer-swap snapshots and never block behind a writer.
//! Writers serialize on an update token: [`SmapOwner::begin_update`] hands
//! out a draft clone, and [`SmapUpdate::commit`] swaps the published
//! pointer and notifies subscribed listeners with `(old, new)` on the
//! committer's context, still under the token, so notifications are
//! serialized with respect to other commits.

use crate::smap::Smap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::Arc;
use tracing::debug;

/// Subscriber notified after each cluster-map commit
pub trait SmapListener: Send + Sync {
    fn smap_changed(&self, old: &Smap, new: &Smap);
}

/// Owner of the published cluster map
pub struct SmapOwner {
    cur: RwLock<Arc<Smap>>,
    update_mu: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn SmapListener>>>,
}

impl SmapOwner {
    pub fn new(initial: Smap) -> Self {
        Self {
            cur: RwLock::new(Arc::new(initial)),
            update_mu: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Current snapshot; cheap, never blocks behind an in-flight update
    pub fn get(&self) -> Arc<Smap> {
        self.cur.read().clone()
    }

    /// Register a listener for subsequent commits
    pub fn subscribe(&self, listener: Arc<dyn SmapListener>) {
        self.listeners.write().push(listener);
    }

    /// Take the exclusive update token and a draft clone of the current map
    pub fn begin_update(&self) -> SmapUpdate<'_> {
        let token = self.update_mu.lock();
        let draft = (**self.cur.read()).clone();
        SmapUpdate {
            owner: self,
            _token: token,
            draft,
        }
    }
}

impl Default for SmapOwner {
    fn default() -> Self {
        Self::new(Smap::default())
    }
}

/// An in-flight cluster-map update
///
/// Holds the exclusive update token for its lifetime. Dropping the guard
/// without calling [`SmapUpdate::commit`] discards the draft.
pub struct SmapUpdate<'a> {
    owner: &'a SmapOwner,
    _token: MutexGuard<'a, ()>,
    /// The draft under construction; starts as a clone of the current map
    pub draft: Smap,
}

impl SmapUpdate<'_> {
    /// Publish the draft and notify listeners
    pub fn commit(self) -> Arc<Smap> {
        let new = Arc::new(self.draft);
        let old = {
            let mut cur = self.owner.cur.write();
            std::mem::replace(&mut *cur, new.clone())
        };
        debug!(old = old.version, new = new.version, "cluster map committed");
        for listener in self.owner.listeners.read().iter() {
            listener.smap_changed(&old, &new);
        }
        new
    }

    /// Drop the draft; the published map is unchanged
    pub fn discard(self) {}
}
