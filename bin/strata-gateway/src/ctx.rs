//! Capability context handed to the metasyncer
//!
//! The gateway owns the metasyncer; the metasyncer sees only this narrow
//! surface, never the gateway itself.

use std::sync::Arc;
use strata_cluster::{Smap, SmapOwner};
use strata_common::types::NodeId;
use strata_rpc::{BcastArgs, Broadcaster, CallResult};
use strata_sync::SyncCtx;
use tokio::sync::mpsc;

pub struct GatewayCtx {
    pub owner: Arc<SmapOwner>,
    pub self_id: NodeId,
    pub bcast: Broadcaster,
}

impl SyncCtx for GatewayCtx {
    fn smap(&self) -> Arc<Smap> {
        self.owner.get()
    }

    fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    fn broadcast(&self, args: BcastArgs) -> mpsc::Receiver<CallResult> {
        self.bcast.broadcast(args)
    }
}
