//! Intra-cluster broadcast: fan one request out to a membership subset
//!
//! One task per destination peer, all calls concurrent, results streamed
//! into a channel whose capacity equals the peer count. Every dispatched
//! call runs to completion even if the consumer stops reading; the channel
//! closes once the last call finishes.

use crate::args::{BcastArgs, CallArgs, CallResult, CallTimeout, ReqArgs};
use crate::client::RpcClient;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use std::sync::Arc;
use strata_cluster::{Network, Scope, Smap};
use strata_common::types::NodeId;
use tokio::sync::mpsc;
use tracing::warn;

/// Seam between the broadcaster and the peer caller
#[async_trait]
pub trait Caller: Send + Sync + 'static {
    async fn call(&self, args: CallArgs) -> CallResult;
}

#[async_trait]
impl Caller for RpcClient {
    async fn call(&self, args: CallArgs) -> CallResult {
        RpcClient::call(self, args).await
    }
}

/// Fans requests out to cluster subsets on behalf of one node
pub struct Broadcaster {
    caller: Arc<dyn Caller>,
    self_id: NodeId,
}

impl Broadcaster {
    pub fn new(caller: Arc<dyn Caller>, self_id: NodeId) -> Self {
        Self { caller, self_id }
    }

    /// Broadcast to a scope of the given cluster map
    #[allow(clippy::too_many_arguments)]
    pub fn broadcast_to(
        &self,
        path: &str,
        query: Vec<(String, String)>,
        method: Method,
        body: Option<Bytes>,
        smap: &Smap,
        timeout: CallTimeout,
        network: Network,
        scope: Scope,
    ) -> mpsc::Receiver<CallResult> {
        let nodes = smap.node_maps(scope).into_iter().cloned().collect();
        self.broadcast(BcastArgs {
            req: ReqArgs {
                method,
                base: String::new(),
                path: path.to_string(),
                query,
                body,
            },
            network,
            timeout,
            nodes,
        })
    }

    /// Broadcast to explicit node maps
    ///
    /// Self is always excluded. An empty destination set yields a closed
    /// channel immediately, with a warning.
    pub fn broadcast(&self, args: BcastArgs) -> mpsc::Receiver<CallResult> {
        let count = args
            .nodes
            .iter()
            .flat_map(|m| m.keys())
            .filter(|id| **id != self.self_id)
            .count();
        if count == 0 {
            let (_, rx) = mpsc::channel(1);
            warn!(path = %args.req.path, "broadcast to zero nodes");
            return rx;
        }

        let (tx, rx) = mpsc::channel(count);
        for node_map in &args.nodes {
            for si in node_map.values() {
                if si.id == self.self_id {
                    continue;
                }
                let mut call = CallArgs {
                    si: Some(si.clone()),
                    req: args.req.clone(),
                    timeout: args.timeout,
                };
                call.req.base = si.url(args.network).to_string();
                let caller = self.caller.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let res = caller.call(call).await;
                    // the consumer may have walked away; the call still ran
                    let _ = tx.send(res).await;
                });
            }
        }
        rx
    }
}
