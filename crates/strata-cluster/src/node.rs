//! Node descriptors and network planes

use serde::{Deserialize, Serialize};
use std::fmt;
use strata_common::config::NetConf;
use strata_common::types::{NodeId, NodeRole};

/// Environment variable overriding the derived node ID
pub const NODE_ID_ENV: &str = "STRATA_NODE_ID";

/// Seed for the deterministic node-ID hash
const ID_HASH_SEED: u32 = 1_103_515_245;

/// Network planes a node is reachable on
///
/// The intra planes fall back to the public endpoint unless the
/// configuration carves out a distinct address or port for them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Public,
    IntraControl,
    IntraData,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::IntraControl => write!(f, "intra_control"),
            Self::IntraData => write!(f, "intra_data"),
        }
    }
}

/// Endpoint of a node on one network plane
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInfo {
    /// IPv4 address or hostname
    pub ip: String,
    /// Listening port
    pub port: u16,
    /// Precomputed base URL, e.g. `http://10.0.0.2:8080`
    pub direct_url: String,
}

impl NetInfo {
    /// Build an endpoint, precomputing its base URL
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        let ip = ip.into();
        let direct_url = format!("http://{ip}:{port}");
        Self {
            ip,
            port,
            direct_url,
        }
    }

    /// The `host:port` form of this endpoint
    #[must_use]
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Descriptor of one cluster node
///
/// Carried in the cluster map and in the registration handshake. Identity
/// equality is by [`NodeId`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snode {
    pub id: NodeId,
    pub role: NodeRole,
    pub public_net: NetInfo,
    pub intra_control_net: NetInfo,
    pub intra_data_net: NetInfo,
}

impl Snode {
    /// Base URL of this node on the requested network plane
    #[must_use]
    pub fn url(&self, network: Network) -> &str {
        match network {
            Network::Public => &self.public_net.direct_url,
            Network::IntraControl => &self.intra_control_net.direct_url,
            Network::IntraData => &self.intra_data_net.direct_url,
        }
    }

    /// Build this node's descriptor from its network configuration
    pub fn from_net_conf(id: NodeId, role: NodeRole, net: &NetConf) -> Self {
        let public_net = NetInfo::new(net.ipv4.clone(), net.l4.port);
        let intra_control_net = if net.use_intra_control() {
            NetInfo::new(net.ipv4_intra_control.clone(), net.l4.port_intra_control)
        } else {
            public_net.clone()
        };
        let intra_data_net = if net.use_intra_data() {
            NetInfo::new(net.ipv4_intra_data.clone(), net.l4.port_intra_data)
        } else {
            public_net.clone()
        };
        Self {
            id,
            role,
            public_net,
            intra_control_net,
            intra_data_net,
        }
    }
}

impl PartialEq for Snode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Snode {}

impl fmt::Display for Snode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.role, self.id)
    }
}

/// Derive the node ID for this daemon
///
/// The `STRATA_NODE_ID` environment variable wins when set; otherwise the
/// ID is the low 20 bits of the 32-bit hash of the public `host:port`,
/// rendered as a decimal string.
pub fn derive_node_id(net: &NetConf) -> NodeId {
    if let Ok(id) = std::env::var(NODE_ID_ENV) {
        if !id.is_empty() {
            return NodeId::new(id);
        }
    }
    let host_port = format!("{}:{}", net.ipv4, net.l4.port);
    let cs = xxhash_rust::xxh32::xxh32(host_port.as_bytes(), ID_HASH_SEED);
    NodeId::new((cs & 0xf_ffff).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::config::L4Conf;

    fn net_conf(ip: &str, port: u16) -> NetConf {
        NetConf {
            ipv4: ip.to_string(),
            ipv4_intra_control: String::new(),
            ipv4_intra_data: String::new(),
            l4: L4Conf {
                port,
                port_intra_control: 0,
                port_intra_data: 0,
            },
        }
    }

    #[test]
    fn test_derived_id_is_deterministic_and_bounded() {
        let net = net_conf("192.168.1.10", 8080);
        let a = derive_node_id(&net);
        let b = derive_node_id(&net);
        assert_eq!(a, b);
        let n: u32 = a.as_str().parse().unwrap();
        assert!(n <= 0xf_ffff);
    }

    #[test]
    fn test_derived_id_depends_on_endpoint() {
        let a = derive_node_id(&net_conf("192.168.1.10", 8080));
        let b = derive_node_id(&net_conf("192.168.1.10", 8081));
        assert_ne!(a, b);
    }

    #[test]
    fn test_intra_planes_fall_back_to_public() {
        let net = net_conf("10.0.0.1", 9000);
        let si = Snode::from_net_conf(NodeId::new("1"), NodeRole::Target, &net);
        assert_eq!(si.url(Network::IntraControl), si.url(Network::Public));
        assert_eq!(si.url(Network::Public), "http://10.0.0.1:9000");
    }

    #[test]
    fn test_intra_control_plane_when_port_differs() {
        let mut net = net_conf("10.0.0.1", 9000);
        net.ipv4_intra_control = "10.0.0.1".to_string();
        net.l4.port_intra_control = 9001;
        let si = Snode::from_net_conf(NodeId::new("1"), NodeRole::Target, &net);
        assert_eq!(si.url(Network::IntraControl), "http://10.0.0.1:9001");
        assert_eq!(si.url(Network::IntraData), "http://10.0.0.1:9000");
    }
}
