//! Configuration surface for Strata daemons
//!
//! Each daemon loads a JSON configuration file into [`Config`]. Every
//! section has code defaults, so a partial file is enough; `validate()`
//! runs after load and after any command-line override has been applied.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Keepalive tracker flavor names accepted in the config file
pub const KEEPALIVE_HEARTBEAT: &str = "heartbeat";
pub const KEEPALIVE_AVERAGE: &str = "average";

/// Root configuration for a Strata daemon
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cluster identity
    pub cluster: ClusterConf,
    /// Node-local settings
    pub node: NodeConf,
    /// Primary gateway bootstrap URLs
    pub gateway: GatewayConf,
    /// Network planes and ports
    pub net: NetConf,
    /// Intra-cluster call timeouts
    pub timeout: TimeoutConf,
    /// Periodic task intervals
    pub periodic: PeriodConf,
    /// Keepalive tracking
    pub keepalive: KeepaliveConf,
}

/// Cluster identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConf {
    /// Cluster name
    pub name: String,
}

impl Default for ClusterConf {
    fn default() -> Self {
        Self {
            name: "strata".to_string(),
        }
    }
}

/// Node-local configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConf {
    /// Directory for locally persisted metadata replicas
    pub data_dir: PathBuf,
}

impl Default for NodeConf {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/strata"),
        }
    }
}

/// Primary gateway bootstrap URLs
///
/// `primary_url` points at the gateway expected to be primary at deployment
/// time. After a failover the primary may move; `discovery_url` (and, as a
/// last resort, `original_url`) give a joining node somewhere else to ask.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConf {
    /// URL of the primary gateway at deployment time
    pub primary_url: String,
    /// Well-known URL to try when the configured primary is unreachable
    pub discovery_url: String,
    /// URL of the original deployment-time primary
    pub original_url: String,
}

/// Network configuration: public plane plus optional intra-cluster planes
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConf {
    /// Public (client-facing) IPv4 address or hostname
    pub ipv4: String,
    /// Intra-control plane address; empty disables the dedicated plane
    pub ipv4_intra_control: String,
    /// Intra-data plane address; empty disables the dedicated plane
    pub ipv4_intra_data: String,
    /// Layer-4 ports
    pub l4: L4Conf,
}

impl Default for NetConf {
    fn default() -> Self {
        Self {
            ipv4: "127.0.0.1".to_string(),
            ipv4_intra_control: String::new(),
            ipv4_intra_data: String::new(),
            l4: L4Conf::default(),
        }
    }
}

impl NetConf {
    /// A dedicated intra-control plane is in use only when its address or
    /// port differs from the public plane.
    #[must_use]
    pub fn use_intra_control(&self) -> bool {
        if self.ipv4_intra_control.is_empty() || self.l4.port_intra_control == 0 {
            return false;
        }
        self.ipv4_intra_control != self.ipv4 || self.l4.port_intra_control != self.l4.port
    }

    /// Same rule as [`NetConf::use_intra_control`], for the data plane.
    #[must_use]
    pub fn use_intra_data(&self) -> bool {
        if self.ipv4_intra_data.is_empty() || self.l4.port_intra_data == 0 {
            return false;
        }
        self.ipv4_intra_data != self.ipv4 || self.l4.port_intra_data != self.l4.port
    }
}

/// Layer-4 port configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct L4Conf {
    /// Public listening port
    pub port: u16,
    /// Intra-control listening port; 0 disables the dedicated plane
    pub port_intra_control: u16,
    /// Intra-data listening port; 0 disables the dedicated plane
    pub port_intra_data: u16,
}

impl Default for L4Conf {
    fn default() -> Self {
        Self {
            port: 8080,
            port_intra_control: 0,
            port_intra_data: 0,
        }
    }
}

/// Timeouts for intra-cluster communication
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConf {
    /// Default client timeout (keepalive probes, control-plane ops), ms
    pub default_ms: u64,
    /// Long client timeout (bulk or slow ops), ms
    pub default_long_ms: u64,
    /// Upper bound used when re-trying refused peers, ms
    pub max_keepalive_ms: u64,
    /// One control-plane operation, ms
    pub cplane_operation_ms: u64,
}

impl Default for TimeoutConf {
    fn default() -> Self {
        Self {
            default_ms: 30_000,
            default_long_ms: 300_000,
            max_keepalive_ms: 4_000,
            cplane_operation_ms: 2_000,
        }
    }
}

impl TimeoutConf {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_ms)
    }

    pub fn default_long(&self) -> Duration {
        Duration::from_millis(self.default_long_ms)
    }

    pub fn max_keepalive(&self) -> Duration {
        Duration::from_millis(self.max_keepalive_ms)
    }

    pub fn cplane_operation(&self) -> Duration {
        Duration::from_millis(self.cplane_operation_ms)
    }
}

/// Periodic task intervals
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodConf {
    /// Interval between re-broadcasts to peers that owe metadata, ms
    pub retry_sync_time_ms: u64,
}

impl Default for PeriodConf {
    fn default() -> Self {
        Self {
            retry_sync_time_ms: 2_000,
        }
    }
}

impl PeriodConf {
    pub fn retry_sync_time(&self) -> Duration {
        Duration::from_millis(self.retry_sync_time_ms)
    }
}

/// Configuration for one keepalive tracker
///
/// Both tracker flavors share the struct; `factor` is meaningful to both
/// (liveness window multiplier), the EWMA damping applies to `average` only.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConf {
    /// Probe interval, ms
    pub interval_ms: u64,
    /// Tracker flavor: "heartbeat" or "average"
    pub name: String,
    /// Liveness window multiplier / EWMA damping factor
    pub factor: u8,
}

impl Default for TrackerConf {
    fn default() -> Self {
        Self {
            interval_ms: 3_000,
            name: KEEPALIVE_HEARTBEAT.to_string(),
            factor: 3,
        }
    }
}

impl TrackerConf {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Keepalive configuration for both node roles
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConf {
    /// How a gateway tracks the liveness of other nodes
    pub gateway: TrackerConf,
    /// How a target reports to (and tracks) the primary gateway
    pub target: TrackerConf,
    /// Bounds re-probe backoff at `retry_factor * interval`
    pub retry_factor: u8,
    /// A peer silent for `timeout_factor * interval` is declared dead
    pub timeout_factor: u8,
}

impl Default for KeepaliveConf {
    fn default() -> Self {
        Self {
            gateway: TrackerConf::default(),
            target: TrackerConf::default(),
            retry_factor: 5,
            timeout_factor: 4,
        }
    }
}

fn valid_keepalive_type(name: &str) -> bool {
    name == KEEPALIVE_HEARTBEAT || name == KEEPALIVE_AVERAGE
}

impl Config {
    /// Load configuration from a JSON file and validate it
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.net.l4.port == 0 {
            return Err(Error::configuration("net.l4.port must be non-zero"));
        }
        if self.timeout.cplane_operation_ms == 0 {
            return Err(Error::configuration(
                "timeout.cplane_operation_ms must be non-zero",
            ));
        }
        if self.periodic.retry_sync_time_ms == 0 {
            return Err(Error::configuration(
                "periodic.retry_sync_time_ms must be non-zero",
            ));
        }
        if !valid_keepalive_type(&self.keepalive.gateway.name) {
            return Err(Error::configuration(format!(
                "bad gateway keepalive tracker type {}",
                self.keepalive.gateway.name
            )));
        }
        if !valid_keepalive_type(&self.keepalive.target.name) {
            return Err(Error::configuration(format!(
                "bad target keepalive tracker type {}",
                self.keepalive.target.name
            )));
        }
        if self.keepalive.gateway.interval_ms == 0 || self.keepalive.target.interval_ms == 0 {
            return Err(Error::configuration(
                "keepalive intervals must be non-zero",
            ));
        }
        Ok(())
    }
}
