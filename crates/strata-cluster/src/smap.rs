//! Cluster map snapshot
//!
//! An [`Smap`] is an immutable value once published: membership changes go
//! through [`crate::owner::SmapOwner`], which clones, mutates the clone,
//! bumps the version, and swaps the published pointer.

use crate::node::Snode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strata_common::types::NodeId;

/// Mapping from node ID to descriptor
pub type NodeMap = HashMap<NodeId, Snode>;

/// Which subset of the cluster a broadcast addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Targets,
    Gateways,
    All,
}

/// Cluster map snapshot: the authoritative membership record
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Smap {
    /// Monotonically increasing map version
    pub version: u64,
    /// ID of the primary gateway; must be present in `gateways` when set
    pub primary_id: NodeId,
    /// Gateways by ID
    pub gateways: NodeMap,
    /// Targets by ID
    pub targets: NodeMap,
}

impl Smap {
    /// Seed a new map with a single primary gateway, at version 1
    pub fn bootstrap(primary: Snode) -> Self {
        let mut gateways = NodeMap::new();
        let primary_id = primary.id.clone();
        gateways.insert(primary_id.clone(), primary);
        Self {
            version: 1,
            primary_id,
            gateways,
            targets: NodeMap::new(),
        }
    }

    /// A map is valid when its primary is set and present among gateways
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.primary_id.is_empty() && self.gateways.contains_key(&self.primary_id)
    }

    /// Whether `id` is the primary gateway of this map
    #[must_use]
    pub fn is_primary(&self, id: &NodeId) -> bool {
        self.is_valid() && &self.primary_id == id
    }

    /// Descriptor of the primary gateway
    #[must_use]
    pub fn primary(&self) -> Option<&Snode> {
        self.gateways.get(&self.primary_id)
    }

    #[must_use]
    pub fn get_target(&self, id: &NodeId) -> Option<&Snode> {
        self.targets.get(id)
    }

    #[must_use]
    pub fn get_gateway(&self, id: &NodeId) -> Option<&Snode> {
        self.gateways.get(id)
    }

    /// Look up a node of either role
    #[must_use]
    pub fn get_node(&self, id: &NodeId) -> Option<&Snode> {
        self.targets.get(id).or_else(|| self.gateways.get(id))
    }

    /// Whether a node of either role is a member
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.targets.contains_key(id) || self.gateways.contains_key(id)
    }

    #[must_use]
    pub fn count_targets(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn count_gateways(&self) -> usize {
        self.gateways.len()
    }

    /// The node maps a broadcast scope selects, in iteration order
    #[must_use]
    pub fn node_maps(&self, scope: Scope) -> Vec<&NodeMap> {
        match scope {
            Scope::Targets => vec![&self.targets],
            Scope::Gateways => vec![&self.gateways],
            Scope::All => vec![&self.gateways, &self.targets],
        }
    }

    /// Iterate over every member node of either role
    pub fn iter_nodes(&self) -> impl Iterator<Item = &Snode> {
        self.gateways.values().chain(self.targets.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NetInfo;
    use strata_common::types::NodeRole;

    fn test_snode(id: &str, role: NodeRole, port: u16) -> Snode {
        let net = NetInfo::new("127.0.0.1", port);
        Snode {
            id: NodeId::new(id),
            role,
            public_net: net.clone(),
            intra_control_net: net.clone(),
            intra_data_net: net,
        }
    }

    #[test]
    fn test_bootstrap_map() {
        let smap = Smap::bootstrap(test_snode("p0", NodeRole::Gateway, 8080));
        assert_eq!(smap.version, 1);
        assert!(smap.is_valid());
        assert!(smap.is_primary(&NodeId::new("p0")));
        assert_eq!(smap.count_gateways(), 1);
        assert_eq!(smap.count_targets(), 0);
    }

    #[test]
    fn test_validity_requires_primary_among_gateways() {
        let mut smap = Smap::bootstrap(test_snode("p0", NodeRole::Gateway, 8080));
        smap.primary_id = NodeId::new("p9");
        assert!(!smap.is_valid());
        assert!(!smap.is_primary(&NodeId::new("p9")));

        smap.primary_id = NodeId::default();
        assert!(!smap.is_valid());
    }

    #[test]
    fn test_scope_selection() {
        let mut smap = Smap::bootstrap(test_snode("p0", NodeRole::Gateway, 8080));
        let t1 = test_snode("t1", NodeRole::Target, 9000);
        smap.targets.insert(t1.id.clone(), t1);

        let total: usize = smap.node_maps(Scope::All).iter().map(|m| m.len()).sum();
        assert_eq!(total, 2);
        let targets: usize = smap
            .node_maps(Scope::Targets)
            .iter()
            .map(|m| m.len())
            .sum();
        assert_eq!(targets, 1);
        assert!(smap.contains(&NodeId::new("t1")));
        assert!(smap.get_gateway(&NodeId::new("t1")).is_none());
    }
}
