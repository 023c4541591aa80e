//! Receiving side of the metasync protocol
//!
//! Every node parses incoming replication payloads into per-tag
//! `(artifact, action)` pairs, validates shape and version, commits the
//! accepted artifacts to the local owners through their copy-on-write
//! paths, and hands them to subscribed listeners. A strictly lower version
//! is a downgrade attempt and is rejected with no local state change, with
//! one whitelisted exception: a target whose own ID is absent from the
//! received cluster map accepts a same-or-lower map from the primary while
//! it reconciles membership.

use crate::revs::{action_key, ActionMsg, Payload, BMD_TAG, SMAP_TAG, TOKEN_TAG};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use strata_cluster::{BmdOwner, BucketMd, Smap, SmapOwner, Snode, TokenList, TokenOwner};
use strata_common::types::{NodeId, NodeRole};
use thiserror::Error;
use tracing::{info, warn};

/// Rejected replication payloads
#[derive(Debug, Error)]
pub enum RecvError {
    #[error("failed to unmarshal {tag}: {err}")]
    Unmarshal {
        tag: &'static str,
        #[source]
        err: serde_json::Error,
    },

    #[error("invalid cluster map v{version}: lacking or missing the primary")]
    InvalidSmap { version: u64 },

    #[error("{node}: attempt to downgrade {tag} v{local} to v{incoming}")]
    Downgrade {
        node: NodeId,
        tag: &'static str,
        local: u64,
        incoming: u64,
    },
}

fn extract<T: DeserializeOwned>(
    payload: &Payload,
    tag: &'static str,
) -> Result<Option<(T, ActionMsg)>, RecvError> {
    let Some(value) = payload.get(tag) else {
        return Ok(None);
    };
    let artifact: T =
        serde_json::from_str(value).map_err(|err| RecvError::Unmarshal { tag, err })?;
    let msg = match payload.get(&action_key(tag)) {
        Some(raw) => serde_json::from_str(raw).map_err(|err| RecvError::Unmarshal { tag, err })?,
        None => ActionMsg::default(),
    };
    Ok(Some((artifact, msg)))
}

/// Validate an incoming cluster map against the local one
///
/// Returns `Ok(None)` when the payload carries no map or the version is
/// already known.
pub fn extract_smap(
    payload: &Payload,
    local: &Smap,
    si: &Snode,
) -> Result<Option<(Smap, ActionMsg)>, RecvError> {
    let Some((newsmap, msg)) = extract::<Smap>(payload, SMAP_TAG)? else {
        return Ok(None);
    };
    if newsmap.version == local.version {
        return Ok(None);
    }
    if !newsmap.is_valid() {
        return Err(RecvError::InvalidSmap {
            version: newsmap.version,
        });
    }
    if newsmap.version < local.version {
        let reconciling = si.role == NodeRole::Target && newsmap.get_target(&si.id).is_none();
        if !reconciling {
            return Err(RecvError::Downgrade {
                node: si.id.clone(),
                tag: SMAP_TAG,
                local: local.version,
                incoming: newsmap.version,
            });
        }
        warn!(
            node = %si.id,
            incoming = newsmap.version,
            local = local.version,
            "received older cluster map while absent from it - reconciling membership"
        );
    }
    info!(
        incoming = newsmap.version,
        local = local.version,
        ntargets = newsmap.count_targets(),
        action = %msg.action,
        "receive cluster map"
    );
    Ok(Some((newsmap, msg)))
}

/// Validate an incoming bucket catalog against the local version
pub fn extract_bucket_md(
    payload: &Payload,
    local_version: u64,
    node: &NodeId,
) -> Result<Option<(BucketMd, ActionMsg)>, RecvError> {
    let Some((bmd, msg)) = extract::<BucketMd>(payload, BMD_TAG)? else {
        return Ok(None);
    };
    if bmd.version == local_version {
        return Ok(None);
    }
    if bmd.version < local_version {
        return Err(RecvError::Downgrade {
            node: node.clone(),
            tag: BMD_TAG,
            local: local_version,
            incoming: bmd.version,
        });
    }
    Ok(Some((bmd, msg)))
}

/// Validate an incoming revoked-token list against the local version
pub fn extract_token_list(
    payload: &Payload,
    local_version: u64,
    node: &NodeId,
) -> Result<Option<(TokenList, ActionMsg)>, RecvError> {
    let Some((tokens, msg)) = extract::<TokenList>(payload, TOKEN_TAG)? else {
        return Ok(None);
    };
    if tokens.version == local_version {
        return Ok(None);
    }
    if tokens.version < local_version {
        return Err(RecvError::Downgrade {
            node: node.clone(),
            tag: TOKEN_TAG,
            local: local_version,
            incoming: tokens.version,
        });
    }
    Ok(Some((tokens, msg)))
}

/// An accepted replica, as handed to listeners
pub enum ReplicatedArtifact {
    Smap(Arc<Smap>),
    BucketMd(Arc<BucketMd>),
    Tokens(Arc<TokenList>),
}

impl ReplicatedArtifact {
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Smap(_) => SMAP_TAG,
            Self::BucketMd(_) => BMD_TAG,
            Self::Tokens(_) => TOKEN_TAG,
        }
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        match self {
            Self::Smap(smap) => smap.version,
            Self::BucketMd(bmd) => bmd.version,
            Self::Tokens(tokens) => tokens.version,
        }
    }
}

/// Local subscriber to accepted replicas and bare notifications
pub trait RecvListener: Send + Sync {
    /// An artifact was accepted and committed locally
    fn artifact_received(&self, artifact: &ReplicatedArtifact, msg: &ActionMsg);

    /// A bare notify arrived (no artifacts)
    fn action_received(&self, _msg: &ActionMsg) {}
}

/// Applies validated replication payloads to the local owners
pub struct RecvHandler {
    si: Snode,
    smap_owner: Arc<SmapOwner>,
    bmd_owner: Arc<BmdOwner>,
    token_owner: Arc<TokenOwner>,
    listeners: RwLock<Vec<Arc<dyn RecvListener>>>,
}

impl RecvHandler {
    pub fn new(
        si: Snode,
        smap_owner: Arc<SmapOwner>,
        bmd_owner: Arc<BmdOwner>,
        token_owner: Arc<TokenOwner>,
    ) -> Self {
        Self {
            si,
            smap_owner,
            bmd_owner,
            token_owner,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a subscriber
    pub fn subscribe(&self, listener: Arc<dyn RecvListener>) {
        self.listeners.write().push(listener);
    }

    /// Validate and commit one replication payload (a metasync PUT)
    ///
    /// Version checks run twice: once against a pre-lock snapshot (the
    /// error-reporting pass) and again under each owner's update token.
    /// A concurrent delivery may have committed a newer replica between
    /// the two; such a replica is quietly dropped at commit time so a
    /// locally-accepted version never decreases.
    pub fn apply(&self, payload: &Payload) -> Result<(), RecvError> {
        let local = self.smap_owner.get();
        if let Some((newsmap, msg)) = extract_smap(payload, &local, &self.si)? {
            let mut up = self.smap_owner.begin_update();
            // re-validate against the map observed under the token; the
            // reconciliation exception still admits an older map while
            // this target is absent from it
            let reconciling =
                self.si.role == NodeRole::Target && newsmap.get_target(&self.si.id).is_none();
            if newsmap.version > up.draft.version
                || (newsmap.version < up.draft.version && reconciling)
            {
                up.draft = newsmap;
                let committed = up.commit();
                self.dispatch(&ReplicatedArtifact::Smap(committed), &msg);
            } else {
                up.discard();
            }
        }

        let local_bmd = self.bmd_owner.get();
        if let Some((bmd, msg)) = extract_bucket_md(payload, local_bmd.version, &self.si.id)? {
            if let Some(committed) = self.bmd_owner.put_if_newer(bmd) {
                self.dispatch(&ReplicatedArtifact::BucketMd(committed), &msg);
            }
        }

        let local_tokens = self.token_owner.get();
        if let Some((tokens, msg)) =
            extract_token_list(payload, local_tokens.version, &self.si.id)?
        {
            if let Some(committed) = self.token_owner.put_if_newer(tokens) {
                self.dispatch(&ReplicatedArtifact::Tokens(committed), &msg);
            }
        }
        Ok(())
    }

    /// Hand a bare notification (a metasync POST) to the listeners
    pub fn notify(&self, msg: &ActionMsg) {
        info!(action = %msg.action, smap_version = msg.smap_version, "receive notification");
        for listener in self.listeners.read().iter() {
            listener.action_received(msg);
        }
    }

    fn dispatch(&self, artifact: &ReplicatedArtifact, msg: &ActionMsg) {
        for listener in self.listeners.read().iter() {
            listener.artifact_received(artifact, msg);
        }
    }
}
