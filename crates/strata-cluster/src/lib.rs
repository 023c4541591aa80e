//! Cluster membership and replicated metadata artifacts
//!
//! The cluster map ([`Smap`]) is the authoritative membership record: which
//! nodes are targets, which are gateways, and which gateway is primary.
//! This crate also defines the other cluster-wide artifacts the control
//! plane replicates (bucket catalog, revoked-token list) and the
//! copy-on-write owners that hold the local replica of each.

pub mod bucket;
pub mod node;
pub mod owner;
pub mod smap;
pub mod token;

pub use bucket::{BmdOwner, BucketMd, BucketProps};
pub use node::{derive_node_id, NetInfo, Network, Snode};
pub use owner::{SmapListener, SmapOwner, SmapUpdate};
pub use smap::{NodeMap, Scope, Smap};
pub use token::{TokenList, TokenOwner};
