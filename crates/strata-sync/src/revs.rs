//! The REVS contract: replicated, versioned, shared artifacts
//!
//! A REVS is any cluster-wide metadata value the metasyncer replicates.
//! The wire payload pairs each artifact with an action envelope telling
//! receivers what to do with the new replica:
//!
//! ```text
//!     { "<tag>": <json artifact>, "<tag>-action": <json envelope>, ... }
//! ```
//!
//! The contract requires that two artifacts sharing a tag and version
//! serialize to byte-identical payloads: a published version is immutable,
//! changes produce a fresh version.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use strata_cluster::{BucketMd, Smap, TokenList};
use strata_common::types::NodeId;

/// Cluster map tag
pub const SMAP_TAG: &str = "smap";
/// Bucket catalog tag
pub const BMD_TAG: &str = "bucketmd";
/// Revoked-token list tag
pub const TOKEN_TAG: &str = "token";
/// Suffix pairing an action envelope with its artifact on the wire
pub const ACTION_SUFFIX: &str = "-action";

/// Action names carried in the envelope
pub const ACT_REGISTER_TARGET: &str = "register-target";
pub const ACT_REGISTER_GATEWAY: &str = "register-gateway";
pub const ACT_UNREGISTER: &str = "unregister";
pub const ACT_KEEPALIVE_EVICT: &str = "keepalive-evict";
pub const ACT_CREATE_BUCKET: &str = "create-bucket";
pub const ACT_DESTROY_BUCKET: &str = "destroy-bucket";
pub const ACT_REVOKE_TOKEN: &str = "revoke-token";
pub const ACT_SYNC_PENDING: &str = "metasync-pending";

/// The wire payload: tag (or tag-action) to JSON-encoded value
pub type Payload = HashMap<String, String>;

/// Payload key of the action envelope paired with `tag`
#[must_use]
pub fn action_key(tag: &str) -> String {
    format!("{tag}{ACTION_SUFFIX}")
}

/// A replicated, versioned, shared artifact
pub trait Revs: Send + Sync {
    /// Tag naming this kind of artifact on the wire
    fn tag(&self) -> &'static str;
    /// Artifact version; strictly monotone under the sync protocol
    fn version(&self) -> u64;
    /// JSON serialization; must be stable for a given version
    fn marshal(&self) -> serde_json::Result<Bytes>;
}

impl Revs for Smap {
    fn tag(&self) -> &'static str {
        SMAP_TAG
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn marshal(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

impl Revs for BucketMd {
    fn tag(&self) -> &'static str {
        BMD_TAG
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn marshal(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

impl Revs for TokenList {
    fn tag(&self) -> &'static str {
        TOKEN_TAG
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn marshal(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Action envelope accompanying each artifact on the wire
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionMsg {
    /// Action name, e.g. `register-target`
    pub action: String,
    /// Free-form context for the action
    pub value: serde_json::Value,
    /// Sender's cluster-map version at send time
    pub smap_version: u64,
    /// Sender's bucket-catalog version at send time
    pub bmd_version: u64,
    /// Set when a just-joining node must be retried aggressively
    pub new_node_id: NodeId,
}

impl ActionMsg {
    pub fn new(action: impl Into<String>, smap_version: u64, bmd_version: u64) -> Self {
        Self {
            action: action.into(),
            value: serde_json::Value::Null,
            smap_version,
            bmd_version,
            new_node_id: NodeId::default(),
        }
    }

    /// Mark a joining node for aggressive retry
    #[must_use]
    pub fn with_new_node(mut self, id: NodeId) -> Self {
        self.new_node_id = id;
        self
    }
}

/// One unit of replication work: an artifact plus its envelope
#[derive(Clone)]
pub struct RevsPair {
    pub revs: Arc<dyn Revs>,
    pub msg: ActionMsg,
}

impl RevsPair {
    pub fn new(revs: Arc<dyn Revs>, msg: ActionMsg) -> Self {
        Self { revs, msg }
    }
}
