//! Versioned artifact registry
//!
//! Holds the last-published artifact per tag together with a byte-exact
//! clone of its serialization. The clone is what makes the copy-on-write
//! discipline enforceable: if re-serializing a published artifact ever
//! yields different bytes for the same version, somebody mutated a value
//! that was already on the wire, and the process must not keep going.

use crate::revs::Revs;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Rejected `store` attempts (invariant violations panic instead)
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{tag} v{version} is stale: current is v{current}")]
    Stale {
        tag: &'static str,
        version: u64,
        current: u64,
    },

    #[error("{tag} v{version} already published and no new member needs it")]
    Duplicate { tag: &'static str, version: u64 },
}

/// Registry of last-published artifacts, by tag
#[derive(Default)]
pub struct RevsRegistry {
    last: HashMap<&'static str, Arc<dyn Revs>>,
    lastclone: HashMap<&'static str, Bytes>,
}

impl RevsRegistry {
    /// Last-published artifact for `tag`
    pub fn current(&self, tag: &str) -> Option<&Arc<dyn Revs>> {
        self.last.get(tag)
    }

    /// Last-published version for `tag`; 0 when nothing was published yet
    #[must_use]
    pub fn last_version(&self, tag: &str) -> u64 {
        self.last.get(tag).map_or(0, |revs| revs.version())
    }

    /// Recorded serialization clone for `tag`
    pub fn clone_of(&self, tag: &str) -> Option<&Bytes> {
        self.lastclone.get(tag)
    }

    /// Iterate over the published set
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Arc<dyn Revs>)> {
        self.last.iter().map(|(tag, revs)| (*tag, revs))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }

    /// Publish an artifact
    ///
    /// Versions never decrease; re-publishing the current version is
    /// admitted only while some member still needs it (`has_undelivered`),
    /// and only with byte-identical serialization. A byte mismatch at an
    /// already-published version is a fatal invariant violation.
    ///
    /// # Panics
    ///
    /// Panics when `bytes` differs from the recorded clone for the same
    /// (tag, version) pair.
    pub fn store(
        &mut self,
        revs: Arc<dyn Revs>,
        bytes: Bytes,
        has_undelivered: bool,
    ) -> Result<(), StoreError> {
        let (tag, version) = (revs.tag(), revs.version());
        let current = self.last_version(tag);
        if version < current {
            return Err(StoreError::Stale {
                tag,
                version,
                current,
            });
        }
        if version == current && self.last.contains_key(tag) {
            let recorded = &self.lastclone[tag];
            if *recorded != bytes {
                panic!(
                    "CoW violation: previously sync-ed {tag} v{version} has been updated in-place"
                );
            }
            if !has_undelivered {
                return Err(StoreError::Duplicate { tag, version });
            }
        }
        self.last.insert(tag, revs);
        self.lastclone.insert(tag, bytes);
        Ok(())
    }

    /// Re-serialize every published artifact and compare against the
    /// recorded clones
    ///
    /// # Panics
    ///
    /// Panics on any mismatch: a published artifact was mutated in place.
    pub fn audit_cow(&self) {
        for (tag, revs) in &self.last {
            let bytes = revs
                .marshal()
                .unwrap_or_else(|e| panic!("failed to re-serialize {tag}: {e}"));
            if let Some(recorded) = self.lastclone.get(tag) {
                if *recorded != bytes {
                    panic!(
                        "CoW violation: previously sync-ed {} v{} has been updated in-place",
                        tag,
                        revs.version()
                    );
                }
            }
        }
    }

    /// Drop all published state (losing primacy)
    pub fn clear(&mut self) {
        self.last.clear();
        self.lastclone.clear();
    }
}
