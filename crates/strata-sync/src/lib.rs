//! Cluster-wide metadata replication
//!
//! The metasyncer keeps every node's view of cluster metadata consistent.
//! Any artifact implementing the [`revs::Revs`] contract (replicated,
//! versioned, shared) can ride the same transport: the primary gateway
//! publishes `(artifact, action)` pairs, the metasyncer broadcasts them to
//! the current membership, tracks per-peer delivered versions, retries
//! refused peers in place, and periodically re-syncs whoever still owes a
//! version. Receivers validate and commit through [`receive::RecvHandler`].

pub mod keepalive;
pub mod metasync;
pub mod receive;
pub mod registry;
pub mod revs;

pub use keepalive::{KeepaliveReporter, KeepaliveTracker};
pub use metasync::{Metasyncer, SyncConfig, SyncCtx};
pub use receive::{RecvError, RecvHandler, RecvListener, ReplicatedArtifact};
pub use registry::RevsRegistry;
pub use revs::{ActionMsg, Payload, Revs, RevsPair};
