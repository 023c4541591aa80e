//! Intra-cluster RPC substrate
//!
//! One typed request to one peer ([`client::RpcClient`]), the same request
//! fanned out to a membership subset ([`broadcast::Broadcaster`]), and the
//! registration handshake a node runs to join the cluster ([`join`]).
//!
//! Outcomes are values, never panics: every call produces a [`CallResult`]
//! whose error, if any, is classified so that callers can tell a refused
//! connection from a timeout from an HTTP-level failure.

pub mod args;
pub mod broadcast;
pub mod client;
pub mod error;
pub mod join;

pub use args::{BcastArgs, CallArgs, CallResult, CallTimeout, ReqArgs};
pub use reqwest::Method;
pub use broadcast::{Broadcaster, Caller};
pub use client::{LivenessSink, RpcClient};
pub use error::RpcError;

/// Control-plane URL paths, by API version
pub mod paths {
    /// API version prefix
    pub const VERSION: &str = "v1";
    /// Replication payload endpoint (PUT = sync, POST = notify)
    pub const METASYNC: &str = "/v1/metasync";
    /// Target registration endpoint on the primary
    pub const CLUSTER: &str = "/v1/cluster";
    /// Gateway registration endpoint on the primary
    pub const CLUSTER_GATEWAY: &str = "/v1/cluster/gateway";
    /// Keepalive report endpoint on the primary
    pub const CLUSTER_KEEPALIVE: &str = "/v1/cluster/keepalive";
    /// Unregistration endpoint prefix (`/{id}` appended)
    pub const CLUSTER_DAEMON: &str = "/v1/cluster/daemon";
    /// Liveness endpoint on every node
    pub const HEALTH: &str = "/v1/health";
    /// Introspection endpoint on every node (`?what=...`)
    pub const DAEMON: &str = "/v1/daemon";
}
