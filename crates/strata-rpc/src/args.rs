//! Request and result types for intra-cluster calls

use crate::error::RpcError;
use bytes::Bytes;
use reqwest::Method;
use std::time::Duration;
use strata_cluster::{Network, NodeMap, Snode};
use strata_common::types::NodeId;

/// One HTTP request to be sent to a peer
#[derive(Clone, Debug)]
pub struct ReqArgs {
    /// GET, POST, PUT, ...
    pub method: Method,
    /// Base URL, e.g. `http://10.0.0.2:8080`; filled in per peer by the
    /// broadcaster, or defaulted from the peer descriptor by the caller
    pub base: String,
    /// Path, e.g. `/v1/metasync`
    pub path: String,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// JSON body for POST and PUT
    pub body: Option<Bytes>,
}

impl Default for ReqArgs {
    fn default() -> Self {
        Self {
            method: Method::GET,
            base: String::new(),
            path: String::new(),
            query: Vec::new(),
            body: None,
        }
    }
}

impl ReqArgs {
    /// Assemble the full request URL from base, path, and query
    #[must_use]
    pub fn url(&self) -> String {
        let mut url = self.base.trim_end_matches('/').to_string();
        if !self.path.starts_with('/') {
            url.push('/');
        }
        url.push_str(&self.path);
        if !self.query.is_empty() {
            let encoded: Vec<String> = self
                .query
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            url.push('?');
            url.push_str(&encoded.join("&"));
        }
        url
    }
}

/// How long a single peer call may take
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CallTimeout {
    /// The short default-client timeout (keepalive, control-plane ops)
    #[default]
    Default,
    /// The long-client timeout (bulk or slow ops)
    Long,
    /// Caller-supplied deadline; the long client is used automatically when
    /// it exceeds the default-client timeout
    Explicit(Duration),
}

/// Arguments for one peer-to-peer control-plane call
#[derive(Clone, Debug)]
pub struct CallArgs {
    /// Destination peer; `None` means `req.base` must be set
    pub si: Option<Snode>,
    pub req: ReqArgs,
    pub timeout: CallTimeout,
}

/// Arguments for an intra-cluster broadcast
#[derive(Clone, Debug)]
pub struct BcastArgs {
    /// Path, query, method, and body; the per-peer base URL is filled in
    /// from each destination's descriptor
    pub req: ReqArgs,
    /// Network plane to address the peers on
    pub network: Network,
    /// Applied uniformly to every peer call
    pub timeout: CallTimeout,
    /// Destination node maps (self is skipped)
    pub nodes: Vec<NodeMap>,
}

/// Outcome of one peer call
#[derive(Debug)]
pub struct CallResult {
    /// The peer the call addressed, when known
    pub si: Option<Snode>,
    /// Response body (also the error text for HTTP >= 400)
    pub body: Bytes,
    /// HTTP status when a response arrived, 0 otherwise
    pub status: u16,
    /// Classified failure, `None` on success
    pub err: Option<RpcError>,
}

impl CallResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }

    /// ID of the peer this result belongs to
    #[must_use]
    pub fn node_id(&self) -> Option<&NodeId> {
        self.si.as_ref().map(|si| &si.id)
    }

    /// A failed result carrying no response data
    pub fn failed(si: Option<Snode>, err: RpcError) -> Self {
        let status = match &err {
            RpcError::Status { status, .. } => *status,
            _ => 0,
        };
        Self {
            si,
            body: Bytes::new(),
            status,
            err: Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_base_and_path() {
        let req = ReqArgs {
            base: "http://10.0.0.2:8080/".to_string(),
            path: "/v1/metasync".to_string(),
            ..Default::default()
        };
        assert_eq!(req.url(), "http://10.0.0.2:8080/v1/metasync");

        let req = ReqArgs {
            base: "http://10.0.0.2:8080".to_string(),
            path: "v1/health".to_string(),
            ..Default::default()
        };
        assert_eq!(req.url(), "http://10.0.0.2:8080/v1/health");
    }

    #[test]
    fn test_url_appends_query() {
        let req = ReqArgs {
            base: "http://g1".to_string(),
            path: "/v1/daemon".to_string(),
            query: vec![("what".to_string(), "smap".to_string())],
            ..Default::default()
        };
        assert_eq!(req.url(), "http://g1/v1/daemon?what=smap");
    }
}
