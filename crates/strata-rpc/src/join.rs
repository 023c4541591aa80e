//! Cluster registration handshake
//!
//! A joining node POSTs its descriptor to the primary gateway. The primary
//! referenced by the local cluster map (or, before any map has been
//! received, by the configured `primary_url`) is tried first; on failure
//! the `discovery_url` and then the `original_url` are tried as well, each
//! only when it differs from what was already attempted.

use crate::args::{CallArgs, CallResult, CallTimeout, ReqArgs};
use crate::broadcast::Caller;
use crate::error::RpcError;
use crate::paths;
use bytes::Bytes;
use reqwest::Method;
use std::sync::Arc;
use strata_cluster::{Network, Smap, Snode};
use strata_common::config::Config;
use strata_common::types::NodeRole;
use tracing::{error, info};

/// Attempts per candidate URL
const REGISTER_ATTEMPTS: usize = 2;

/// Pick the URL (and descriptor, when known) of the current primary
///
/// Before the first metasync arrives the local map is empty and the
/// configured `primary_url` is all there is to go on.
pub fn primary_url_and_si(config: &Config, smap: &Smap) -> (String, Option<Snode>) {
    match smap.primary() {
        Some(psi) => (psi.url(Network::IntraControl).to_string(), Some(psi.clone())),
        None => (config.gateway.primary_url.clone(), None),
    }
}

/// Register `si` with the cluster, trying the configured fallback URLs
pub async fn join(
    caller: &Arc<dyn Caller>,
    config: &Config,
    smap: &Smap,
    si: &Snode,
) -> CallResult {
    let (url, psi) = primary_url_and_si(config, smap);
    let res = register_to_url(caller, &url, psi.as_ref(), si, false).await;
    if res.is_ok() {
        return res;
    }

    let discovery = &config.gateway.discovery_url;
    if !discovery.is_empty() && discovery != &url {
        error!(%si, primary = %url, "register failed - retrying via discovery URL {discovery}");
        let alt = register_to_url(caller, discovery, psi.as_ref(), si, false).await;
        if alt.is_ok() {
            return alt;
        }
    }

    let original = &config.gateway.original_url;
    if !original.is_empty() && original != &url && original != discovery {
        error!(%si, "register failed - retrying via original URL {original}");
        let alt = register_to_url(caller, original, psi.as_ref(), si, false).await;
        if alt.is_ok() {
            return alt;
        }
    }
    res
}

/// POST the node descriptor to one URL, with bounded retries
///
/// With `keepalive` set the same handshake doubles as the periodic
/// keepalive report a non-primary node sends to the primary.
pub async fn register_to_url(
    caller: &Arc<dyn Caller>,
    url: &str,
    psi: Option<&Snode>,
    si: &Snode,
    keepalive: bool,
) -> CallResult {
    let body = match serde_json::to_vec(si) {
        Ok(b) => Bytes::from(b),
        Err(e) => return CallResult::failed(None, RpcError::InvalidRequest(e.to_string())),
    };
    let path = if keepalive {
        paths::CLUSTER_KEEPALIVE
    } else {
        match si.role {
            NodeRole::Gateway => paths::CLUSTER_GATEWAY,
            NodeRole::Target => paths::CLUSTER,
        }
    };

    let mut res = CallResult::failed(None, RpcError::InvalidRequest("not attempted".to_string()));
    for _ in 0..REGISTER_ATTEMPTS {
        res = caller
            .call(CallArgs {
                si: psi.cloned(),
                req: ReqArgs {
                    method: Method::POST,
                    base: url.to_string(),
                    path: path.to_string(),
                    query: Vec::new(),
                    body: Some(body.clone()),
                },
                timeout: CallTimeout::Default,
            })
            .await;
        if res.is_ok() {
            if !keepalive {
                info!(%si, "registered => {url}{path}");
            }
            return res;
        }
        match &res.err {
            Some(err) if err.is_refused() => {
                error!(%si, "register => {url}{path}: connection refused")
            }
            Some(err) => error!(%si, "register => {url}{path}: {err}"),
            None => {}
        }
    }
    res
}
