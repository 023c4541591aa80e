//! The metasyncer: single-writer replication of cluster metadata
//!
//! Exactly one loop per process runs [`SyncLoop::do_sync`]. Callers enqueue
//! work over a bounded channel and never synchronize with the loop
//! directly; requests arriving on a node that is not primary are logged and
//! dropped. On losing primacy the loop drains and resets its internal
//! state, but keeps running so that a later re-election can resume.
//!
//! `do_sync` executes its steps in order, in one serial context:
//!
//! 1. copy-on-write audit of everything already published
//! 2. filter and upgrade the incoming pairs (stale cluster maps are
//!    silently replaced with the current one, duplicates dropped)
//! 3. publish the survivors to the registry and build the wire payload
//! 4. broadcast to all members on the intra-control plane
//! 5. classify per-peer outcomes, splitting refused peers from failures
//! 6. re-broadcast to the refused set, bounded, within this invocation
//! 7. housekeep per-peer delivery state against the current membership
//!
//! Anything still out of sync afterwards is picked up by the retry timer,
//! which re-broadcasts the full published set to the pending peers.

use crate::registry::RevsRegistry;
use crate::revs::{action_key, ActionMsg, Payload, RevsPair, ACT_SYNC_PENDING, SMAP_TAG};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strata_cluster::{Network, NodeMap, Scope, Smap};
use strata_common::config::Config;
use strata_common::types::NodeId;
use strata_rpc::{paths, BcastArgs, CallResult, CallTimeout, Method, ReqArgs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Upper bound on immediate re-broadcasts to refused peers within one
/// `do_sync` invocation
const REFUSED_RETRY_MAX: usize = 10;

/// Depth of the work channel
const WORK_CHANNEL_DEPTH: usize = 8;

/// The slice of the daemon configuration the metasyncer needs
#[derive(Clone, Copy, Debug)]
pub struct SyncConfig {
    pub cplane_operation: Duration,
    pub max_keepalive: Duration,
    pub retry_sync_time: Duration,
}

impl From<&Config> for SyncConfig {
    fn from(config: &Config) -> Self {
        Self {
            cplane_operation: config.timeout.cplane_operation(),
            max_keepalive: config.timeout.max_keepalive(),
            retry_sync_time: config.periodic.retry_sync_time(),
        }
    }
}

/// Narrow capability interface the metasyncer runs against
///
/// The gateway constructs the metasyncer with this; the metasyncer never
/// holds a reference to the gateway itself.
pub trait SyncCtx: Send + Sync + 'static {
    /// Current cluster-map snapshot
    fn smap(&self) -> Arc<Smap>;
    /// This node's ID
    fn self_id(&self) -> &NodeId;
    /// Fan a request out; per-peer base URLs are filled in downstream
    fn broadcast(&self, args: BcastArgs) -> mpsc::Receiver<CallResult>;
}

struct RevsReq {
    pairs: Vec<RevsPair>,
    msg: Option<ActionMsg>,
    done: Option<oneshot::Sender<usize>>,
}

impl RevsReq {
    /// An empty request is the in-band signal to reset (become non-primary)
    fn is_nil(&self) -> bool {
        self.pairs.is_empty() && self.msg.is_none()
    }
}

/// Handle through which the rest of the gateway talks to the sync loop
#[derive(Clone)]
pub struct Metasyncer {
    ctx: Arc<dyn SyncCtx>,
    work_tx: mpsc::Sender<RevsReq>,
    stop_tx: mpsc::Sender<()>,
}

impl Metasyncer {
    /// Spawn the sync loop and return its handle
    pub fn spawn(ctx: Arc<dyn SyncCtx>, config: SyncConfig) -> (Self, JoinHandle<()>) {
        let (work_tx, work_rx) = mpsc::channel(WORK_CHANNEL_DEPTH);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let mut sync_loop = SyncLoop {
            ctx: ctx.clone(),
            config,
            registry: RevsRegistry::default(),
            revsmap: HashMap::new(),
            work_rx,
            stop_rx,
            retry_deadline: None,
        };
        let task = tokio::spawn(async move { sync_loop.run().await });
        (
            Self {
                ctx,
                work_tx,
                stop_tx,
            },
            task,
        )
    }

    /// Enqueue `(artifact, action)` pairs for replication
    pub async fn sync(&self, pairs: Vec<RevsPair>) {
        if pairs.is_empty() || !self.check_primary() {
            return;
        }
        self.enqueue(RevsReq {
            pairs,
            msg: None,
            done: None,
        })
        .await;
    }

    /// Like [`Metasyncer::sync`], blocking until delivery completes;
    /// returns the number of members that could not be reached
    pub async fn sync_wait(&self, pairs: Vec<RevsPair>) -> usize {
        if pairs.is_empty() || !self.check_primary() {
            return 0;
        }
        let (tx, rx) = oneshot::channel();
        self.enqueue(RevsReq {
            pairs,
            msg: None,
            done: Some(tx),
        })
        .await;
        rx.await.unwrap_or(0)
    }

    /// Nudge peers with a bare action envelope; no artifacts, and the
    /// registry is left untouched
    pub async fn notify(&self, msg: ActionMsg) {
        if !self.check_primary() {
            return;
        }
        self.enqueue(RevsReq {
            pairs: Vec::new(),
            msg: Some(msg),
            done: None,
        })
        .await;
    }

    /// Like [`Metasyncer::notify`], blocking until delivery completes
    pub async fn notify_wait(&self, msg: ActionMsg) -> usize {
        if !self.check_primary() {
            return 0;
        }
        let (tx, rx) = oneshot::channel();
        self.enqueue(RevsReq {
            pairs: Vec::new(),
            msg: Some(msg),
            done: Some(tx),
        })
        .await;
        rx.await.unwrap_or(0)
    }

    /// Serialize cleanup of the loop state after losing primacy
    pub async fn become_non_primary(&self) {
        self.enqueue(RevsReq {
            pairs: Vec::new(),
            msg: None,
            done: None,
        })
        .await;
        info!("becoming non-primary");
    }

    /// Stop the loop; the work channel is not drained
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(()).await;
    }

    async fn enqueue(&self, req: RevsReq) {
        if self.work_tx.send(req).await.is_err() {
            warn!("metasyncer is stopped; request dropped");
        }
    }

    fn check_primary(&self) -> bool {
        let smap = self.ctx.smap();
        let self_id = self.ctx.self_id();
        if smap.is_primary(self_id) {
            return true;
        }
        let reason = if smap.contains(self_id) {
            "the primary"
        } else {
            "present in the cluster map"
        };
        error!(
            self_id = %self_id,
            primary = %smap.primary_id,
            version = smap.version,
            "self is not {reason} - failing the sync request"
        );
        false
    }
}

/// The single-writer loop state
struct SyncLoop {
    ctx: Arc<dyn SyncCtx>,
    config: SyncConfig,
    /// Last-published artifacts and their CoW clones
    registry: RevsRegistry,
    /// Per-peer delivered versions, by tag; maintained only while primary
    revsmap: HashMap<NodeId, HashMap<&'static str, u64>>,
    work_rx: mpsc::Receiver<RevsReq>,
    stop_rx: mpsc::Receiver<()>,
    /// When armed, `handle_pending` fires at this instant
    retry_deadline: Option<Instant>,
}

impl SyncLoop {
    async fn run(&mut self) {
        info!("metasyncer started");
        loop {
            let deadline = self.retry_deadline;
            let retry = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                req = self.work_rx.recv() => {
                    let Some(req) = req else { break };
                    if req.is_nil() {
                        self.reset();
                        continue;
                    }
                    let had_pairs = !req.pairs.is_empty();
                    let cnt = self.do_sync(req.pairs, req.msg).await;
                    if let Some(done) = req.done {
                        let _ = done.send(cnt);
                    }
                    if cnt > 0 && had_pairs && self.retry_deadline.is_none() {
                        self.arm_retry();
                    }
                }
                _ = retry => {
                    let cnt = self.handle_pending().await;
                    if cnt > 0 {
                        self.arm_retry();
                    } else {
                        self.retry_deadline = None;
                    }
                }
                _ = self.stop_rx.recv() => break,
            }
        }
        info!("metasyncer stopped");
    }

    fn arm_retry(&mut self) {
        self.retry_deadline = Some(Instant::now() + self.config.retry_sync_time);
    }

    /// Drop all internal state; runs on the loop's own context so that the
    /// cleanup serializes with in-flight work
    fn reset(&mut self) {
        self.revsmap.clear();
        self.registry.clear();
        self.retry_deadline = None;
        info!("metasync state cleared");
    }

    /// The main method; returns the number of members the sync failed to
    /// reach in this invocation
    async fn do_sync(&mut self, pairs: Vec<RevsPair>, msg: Option<ActionMsg>) -> usize {
        let mut smap = self.ctx.smap();
        let new_cnt = self.count_new_members(&smap);

        // step 1: CoW audit, before any network I/O
        self.registry.audit_cow();

        let method;
        let body: Bytes;
        let mut to_send: Vec<RevsPair> = Vec::new();
        let mut new_node_id = NodeId::default();

        if pairs.is_empty() {
            // pure notify: the action envelope is the whole payload
            let msg = msg.expect("notify request without an action envelope");
            method = Method::POST;
            body = serde_json::to_vec(&msg)
                .map(Bytes::from)
                .expect("failed to serialize action envelope");
        } else {
            debug_assert!(msg.is_none());
            // step 2: filter & upgrade
            for mut pair in pairs {
                let tag = pair.revs.tag();
                let version = pair.revs.version();
                if tag == SMAP_TAG {
                    if version > smap.version {
                        panic!(
                            "FATAL: {tag} v{version} is newer than the current cluster map v{}",
                            smap.version
                        );
                    } else if version < smap.version {
                        warn!(
                            tag,
                            version,
                            current = smap.version,
                            "stale cluster map submitted - broadcasting the current one"
                        );
                        pair.revs = smap.clone();
                    }
                }
                let version = pair.revs.version();
                let lversion = self.registry.last_version(tag);
                if version == lversion {
                    if new_cnt == 0 {
                        error!(tag, version, "duplicated - already sync-ed or pending");
                        continue;
                    }
                    info!(tag, version, new_cnt, "duplicated - proceeding to sync new member(s)");
                } else if version < lversion {
                    error!(tag, version, lversion, "skipping: older than last sync-ed");
                    continue;
                }
                to_send.push(pair);
            }
            if to_send.is_empty() {
                return 0;
            }

            // step 3: publish the survivors and build the payload
            let mut payload = Payload::new();
            for pair in &to_send {
                let tag = pair.revs.tag();
                info!(tag, action = %pair.msg.action, version = pair.revs.version(), "dosync");
                let bytes = pair
                    .revs
                    .marshal()
                    .unwrap_or_else(|e| panic!("failed to serialize {tag}: {e}"));
                if let Err(err) = self.registry.store(pair.revs.clone(), bytes.clone(), new_cnt > 0)
                {
                    error!(%err, "not publishing");
                    continue;
                }
                let msg_bytes = serde_json::to_vec(&pair.msg)
                    .expect("failed to serialize action envelope");
                if !pair.msg.new_node_id.is_empty() {
                    new_node_id = pair.msg.new_node_id.clone();
                }
                payload.insert(
                    tag.to_string(),
                    String::from_utf8(bytes.to_vec()).expect("json is utf-8"),
                );
                payload.insert(
                    action_key(tag),
                    String::from_utf8(msg_bytes).expect("json is utf-8"),
                );
            }
            method = Method::PUT;
            body = serde_json::to_vec(&payload)
                .map(Bytes::from)
                .expect("failed to serialize payload");
        }

        // step 4: broadcast to all members on the intra-control plane
        let mut rx = self.ctx.broadcast(BcastArgs {
            req: ReqArgs {
                method: method.clone(),
                path: paths::METASYNC.to_string(),
                body: Some(body.clone()),
                ..Default::default()
            },
            network: Network::IntraControl,
            timeout: CallTimeout::Explicit(self.config.cplane_operation * 2),
            nodes: smap.node_maps(Scope::All).into_iter().cloned().collect(),
        });

        // step 5: classify outcomes; refused peers (and the joining node,
        // whatever its error) get retried right away
        let mut cnt = 0;
        let mut refused = NodeMap::new();
        while let Some(res) = rx.recv().await {
            let Some(si) = res.si else { continue };
            match res.err {
                None => {
                    if !to_send.is_empty() {
                        self.sync_done(si.id, &to_send);
                    }
                }
                Some(err) => {
                    warn!(peer = %si, %err, status = res.status, "failed to sync");
                    if err.is_refused() || si.id == new_node_id {
                        refused.insert(si.id.clone(), si);
                    } else {
                        cnt += 1;
                    }
                }
            }
        }

        // step 6: handle connection-refused in place, bounded
        for _ in 0..REFUSED_RETRY_MAX {
            if refused.is_empty() {
                break;
            }
            tokio::time::sleep(self.config.cplane_operation).await;
            smap = self.ctx.smap();
            if !smap.is_primary(self.ctx.self_id()) {
                self.reset();
                return cnt;
            }
            self.handle_refused(method.clone(), &body, &mut refused, &to_send)
                .await;
        }

        // step 7: housekeep delivery state and fold in what is still refused
        let smap = self.ctx.smap();
        self.revsmap.retain(|id, _| smap.contains(id));
        cnt + refused.len()
    }

    /// Re-broadcast the same payload exclusively to the refused set
    async fn handle_refused(
        &mut self,
        method: Method,
        body: &Bytes,
        refused: &mut NodeMap,
        pairs: &[RevsPair],
    ) {
        let mut rx = self.ctx.broadcast(BcastArgs {
            req: ReqArgs {
                method,
                path: paths::METASYNC.to_string(),
                body: Some(body.clone()),
                ..Default::default()
            },
            network: Network::IntraControl,
            timeout: CallTimeout::Explicit(self.config.max_keepalive),
            nodes: vec![refused.clone()],
        });
        while let Some(res) = rx.recv().await {
            let Some(si) = res.si else { continue };
            match res.err {
                None => {
                    refused.remove(&si.id);
                    self.sync_done(si.id.clone(), pairs);
                    info!(peer = %si, "handle-refused: sync-ed");
                }
                Some(err) => {
                    warn!(peer = %si, %err, status = res.status, "handle-refused: still failing");
                }
            }
        }
    }

    /// Record that `sid` acknowledged every pair of this broadcast
    fn sync_done(&mut self, sid: NodeId, pairs: &[RevsPair]) {
        let vermap = self.revsmap.entry(sid).or_default();
        for pair in pairs {
            vermap.insert(pair.revs.tag(), pair.revs.version());
        }
    }

    /// Members with no delivery record at all (just-joined)
    fn count_new_members(&self, smap: &Smap) -> usize {
        smap.iter_nodes()
            .filter(|si| si.id != *self.ctx.self_id() && !self.revsmap.contains_key(&si.id))
            .count()
    }

    /// Members that owe at least one version of at least one published tag
    ///
    /// Creates delivery-state entries lazily for members seen here for the
    /// first time.
    fn pending_nodes(&mut self, smap: &Smap) -> NodeMap {
        let mut pending = NodeMap::new();
        for si in smap.iter_nodes() {
            if si.id == *self.ctx.self_id() {
                continue;
            }
            let vermap = self.revsmap.entry(si.id.clone()).or_default();
            let in_sync = self.registry.iter().all(|(tag, revs)| {
                let delivered = vermap.get(tag).copied().unwrap_or(0);
                debug_assert!(delivered <= revs.version());
                delivered == revs.version()
            });
            if !in_sync {
                pending.insert(si.id.clone(), si.clone());
            }
        }
        pending
    }

    /// Fires on the retry timer: re-broadcast the full published set to the
    /// pending peers; returns the number still out of sync
    async fn handle_pending(&mut self) -> usize {
        let smap = self.ctx.smap();
        if !smap.is_primary(self.ctx.self_id()) {
            self.reset();
            return 0;
        }
        let pending = self.pending_nodes(&smap);
        if pending.is_empty() {
            info!("no pending metadata - all in sync");
            return 0;
        }

        let msg = ActionMsg::new(ACT_SYNC_PENDING, smap.version, 0);
        let msg_bytes =
            serde_json::to_vec(&msg).expect("failed to serialize action envelope");
        let mut payload = Payload::new();
        let mut pairs = Vec::new();
        for (tag, revs) in self.registry.iter() {
            let bytes = revs
                .marshal()
                .unwrap_or_else(|e| panic!("failed to serialize {tag}: {e}"));
            payload.insert(
                tag.to_string(),
                String::from_utf8(bytes.to_vec()).expect("json is utf-8"),
            );
            payload.insert(
                action_key(tag),
                String::from_utf8(msg_bytes.clone()).expect("json is utf-8"),
            );
            pairs.push(RevsPair::new(revs.clone(), msg.clone()));
        }
        let body = serde_json::to_vec(&payload)
            .map(Bytes::from)
            .expect("failed to serialize payload");

        let mut rx = self.ctx.broadcast(BcastArgs {
            req: ReqArgs {
                method: Method::PUT,
                path: paths::METASYNC.to_string(),
                body: Some(body),
                ..Default::default()
            },
            network: Network::IntraControl,
            timeout: CallTimeout::Explicit(self.config.cplane_operation),
            nodes: vec![pending],
        });

        let mut cnt = 0;
        while let Some(res) = rx.recv().await {
            let Some(si) = res.si else { continue };
            match res.err {
                None => {
                    self.sync_done(si.id.clone(), &pairs);
                    info!(peer = %si, "handle-pending: sync-ed");
                }
                Some(err) => {
                    cnt += 1;
                    warn!(peer = %si, %err, status = res.status, "handle-pending: failing to sync");
                }
            }
        }
        cnt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revs::{Revs, ACT_REGISTER_TARGET, BMD_TAG};
    use parking_lot::{Mutex, RwLock};
    use std::collections::VecDeque;
    use strata_cluster::{NetInfo, Snode};
    use strata_common::types::NodeRole;
    use strata_rpc::RpcError;

    #[derive(Clone, Copy, Debug)]
    enum Outcome {
        Ok,
        Refused,
        Status(u16),
    }

    #[derive(Clone, Debug)]
    struct Recorded {
        method: Method,
        peer: NodeId,
        body: Bytes,
    }

    /// Scripted capability context: per-peer outcome queues, every
    /// broadcast recorded
    struct MockCtx {
        self_id: NodeId,
        smap: RwLock<Arc<Smap>>,
        script: Mutex<HashMap<NodeId, VecDeque<Outcome>>>,
        calls: Mutex<Vec<Recorded>>,
    }

    impl MockCtx {
        fn new(self_id: &str, smap: Smap) -> Arc<Self> {
            Arc::new(Self {
                self_id: NodeId::new(self_id),
                smap: RwLock::new(Arc::new(smap)),
                script: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn script_peer(&self, id: &str, outcomes: &[Outcome]) {
            self.script
                .lock()
                .insert(NodeId::new(id), outcomes.iter().copied().collect());
        }

        fn set_smap(&self, smap: Smap) {
            *self.smap.write() = Arc::new(smap);
        }

        fn calls_to(&self, id: &str) -> usize {
            let id = NodeId::new(id);
            self.calls.lock().iter().filter(|c| c.peer == id).count()
        }
    }

    impl SyncCtx for MockCtx {
        fn smap(&self) -> Arc<Smap> {
            self.smap.read().clone()
        }

        fn self_id(&self) -> &NodeId {
            &self.self_id
        }

        fn broadcast(&self, args: BcastArgs) -> mpsc::Receiver<CallResult> {
            let count: usize = args
                .nodes
                .iter()
                .flat_map(|m| m.keys())
                .filter(|id| **id != self.self_id)
                .count();
            let (tx, rx) = mpsc::channel(count.max(1));
            for node_map in &args.nodes {
                for si in node_map.values() {
                    if si.id == self.self_id {
                        continue;
                    }
                    self.calls.lock().push(Recorded {
                        method: args.req.method.clone(),
                        peer: si.id.clone(),
                        body: args.req.body.clone().unwrap_or_default(),
                    });
                    let outcome = self
                        .script
                        .lock()
                        .get_mut(&si.id)
                        .and_then(|q| q.pop_front())
                        .unwrap_or(Outcome::Ok);
                    let res = match outcome {
                        Outcome::Ok => CallResult {
                            si: Some(si.clone()),
                            ..Default::default()
                        },
                        Outcome::Refused => CallResult::failed(
                            Some(si.clone()),
                            RpcError::Refused("connect".to_string()),
                        ),
                        Outcome::Status(status) => CallResult::failed(
                            Some(si.clone()),
                            RpcError::Status {
                                status,
                                body: "unavailable".to_string(),
                            },
                        ),
                    };
                    tx.try_send(res).expect("result channel sized to peer count");
                }
            }
            rx
        }
    }

    fn snode(id: &str, role: NodeRole, port: u16) -> Snode {
        let net = NetInfo::new("127.0.0.1", port);
        Snode {
            id: NodeId::new(id),
            role,
            public_net: net.clone(),
            intra_control_net: net.clone(),
            intra_data_net: net,
        }
    }

    fn smap_with_targets(version: u64, primary: &str, targets: &[&str]) -> Smap {
        let mut smap = Smap::bootstrap(snode(primary, NodeRole::Gateway, 8080));
        for (i, id) in targets.iter().enumerate() {
            let t = snode(id, NodeRole::Target, 9000 + i as u16);
            smap.targets.insert(t.id.clone(), t);
        }
        smap.version = version;
        smap
    }

    fn sync_config() -> SyncConfig {
        SyncConfig {
            cplane_operation: Duration::from_millis(100),
            max_keepalive: Duration::from_millis(400),
            retry_sync_time: Duration::from_millis(500),
        }
    }

    fn sync_loop(ctx: Arc<MockCtx>) -> SyncLoop {
        let (_tx, work_rx) = mpsc::channel(WORK_CHANNEL_DEPTH);
        let (_stop, stop_rx) = mpsc::channel(1);
        SyncLoop {
            ctx,
            config: sync_config(),
            registry: RevsRegistry::default(),
            revsmap: HashMap::new(),
            work_rx,
            stop_rx,
            retry_deadline: None,
        }
    }

    fn smap_pair(smap: &Arc<Smap>, action: &str, new_node: Option<&str>) -> RevsPair {
        let mut msg = ActionMsg::new(action, smap.version, 0);
        if let Some(id) = new_node {
            msg = msg.with_new_node(NodeId::new(id));
        }
        RevsPair::new(smap.clone() as Arc<dyn Revs>, msg)
    }

    #[tokio::test]
    async fn test_two_node_join() {
        let ctx = MockCtx::new("p0", smap_with_targets(2, "p0", &["t1"]));
        let mut ml = sync_loop(ctx.clone());

        let smap = ctx.smap();
        let cnt = ml
            .do_sync(vec![smap_pair(&smap, ACT_REGISTER_TARGET, Some("t1"))], None)
            .await;

        assert_eq!(cnt, 0);
        assert_eq!(ctx.calls_to("t1"), 1);
        let calls = ctx.calls.lock();
        assert_eq!(calls[0].method, Method::PUT);
        let payload: Payload = serde_json::from_slice(&calls[0].body).unwrap();
        let sent: Smap = serde_json::from_str(&payload[SMAP_TAG]).unwrap();
        assert_eq!(sent.version, 2);
        let msg: ActionMsg = serde_json::from_str(&payload[&action_key(SMAP_TAG)]).unwrap();
        assert_eq!(msg.action, ACT_REGISTER_TARGET);
        drop(calls);

        assert_eq!(ml.revsmap[&NodeId::new("t1")][SMAP_TAG], 2);
        let smap = ctx.smap();
        assert!(ml.pending_nodes(&smap).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_refusal_retried_in_place() {
        let ctx = MockCtx::new("p0", smap_with_targets(3, "p0", &["t1", "t2"]));
        ctx.script_peer("t1", &[Outcome::Refused, Outcome::Ok]);
        let mut ml = sync_loop(ctx.clone());

        let smap = ctx.smap();
        let cnt = ml
            .do_sync(vec![smap_pair(&smap, ACT_REGISTER_TARGET, None)], None)
            .await;

        assert_eq!(cnt, 0);
        assert_eq!(ctx.calls_to("t1"), 2);
        assert_eq!(ctx.calls_to("t2"), 1);
        assert_eq!(ml.revsmap[&NodeId::new("t1")][SMAP_TAG], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_rolls_into_pending() {
        let ctx = MockCtx::new("p0", smap_with_targets(3, "p0", &["t1", "t2"]));
        ctx.script_peer("t2", &[Outcome::Status(503); 5]);
        let mut ml = sync_loop(ctx.clone());

        let smap = ctx.smap();
        let cnt = ml
            .do_sync(vec![smap_pair(&smap, ACT_REGISTER_TARGET, None)], None)
            .await;

        // an HTTP failure is not retried within do_sync
        assert_eq!(cnt, 1);
        assert_eq!(ctx.calls_to("t2"), 1);
        let pending = ml.pending_nodes(&ctx.smap());
        assert_eq!(pending.len(), 1);
        assert!(pending.contains_key(&NodeId::new("t2")));

        // the timer path re-broadcasts exclusively to the pending set
        let before_t1 = ctx.calls_to("t1");
        let cnt = ml.handle_pending().await;
        assert_eq!(cnt, 1); // 503 again
        assert_eq!(ctx.calls_to("t1"), before_t1);

        // t2 recovers; the next firing converges
        ctx.script_peer("t2", &[Outcome::Ok]);
        let cnt = ml.handle_pending().await;
        assert_eq!(cnt, 0);
        assert_eq!(ml.revsmap[&NodeId::new("t2")][SMAP_TAG], 3);
        assert!(ml.pending_nodes(&ctx.smap()).is_empty());
    }

    struct Leaky {
        version: u64,
        payload: Mutex<String>,
    }

    impl Revs for Leaky {
        fn tag(&self) -> &'static str {
            BMD_TAG
        }

        fn version(&self) -> u64 {
            self.version
        }

        fn marshal(&self) -> serde_json::Result<Bytes> {
            Ok(Bytes::from(self.payload.lock().clone()))
        }
    }

    #[tokio::test]
    #[should_panic(expected = "CoW violation")]
    async fn test_cow_violation_aborts_before_network_io() {
        let ctx = MockCtx::new("p0", smap_with_targets(2, "p0", &["t1"]));
        let mut ml = sync_loop(ctx.clone());

        let artifact = Arc::new(Leaky {
            version: 4,
            payload: Mutex::new("{\"v\":4}".to_string()),
        });
        let pair = RevsPair::new(artifact.clone() as Arc<dyn Revs>, ActionMsg::new("publish", 2, 0));
        assert_eq!(ml.do_sync(vec![pair], None).await, 0);

        // external code mutates the published artifact in place
        *artifact.payload.lock() = "{\"v\":4,\"oops\":true}".to_string();
        let smap = ctx.smap();
        let _ = ml
            .do_sync(vec![smap_pair(&smap, "membership-change", None)], None)
            .await;
    }

    #[tokio::test]
    #[should_panic(expected = "newer than the current cluster map")]
    async fn test_smap_ahead_of_store_is_fatal() {
        let ctx = MockCtx::new("p0", smap_with_targets(2, "p0", &["t1"]));
        let mut ml = sync_loop(ctx.clone());

        let mut ahead = smap_with_targets(5, "p0", &["t1"]);
        ahead.version = 5;
        let pair = RevsPair::new(Arc::new(ahead) as Arc<dyn Revs>, ActionMsg::new("x", 5, 0));
        let _ = ml.do_sync(vec![pair], None).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_loss_mid_sync_resets_state() {
        let ctx = MockCtx::new("p0", smap_with_targets(3, "p0", &["t1", "t2"]));
        // t1 keeps refusing, forcing do_sync into the refused-retry phase
        ctx.script_peer("t1", &[Outcome::Refused; 12]);
        let mut ml = sync_loop(ctx.clone());

        // primacy moves to p9 while the sync is in flight
        let mut next = smap_with_targets(4, "p0", &["t1", "t2"]);
        let p9 = snode("p9", NodeRole::Gateway, 8090);
        next.gateways.insert(p9.id.clone(), p9);
        next.primary_id = NodeId::new("p9");
        next.version = 4;

        let smap = ctx.smap();
        let pair = smap_pair(&smap, ACT_REGISTER_TARGET, None);
        let first_attempt = ctx.calls_to("t1") + 1;
        ctx.set_smap(next);
        let cnt = ml.do_sync(vec![pair], None).await;

        assert_eq!(cnt, 0);
        // one broadcast went out; the refused retry bailed on the primary check
        assert_eq!(ctx.calls_to("t1"), first_attempt);
        assert!(ml.registry.is_empty());
        assert!(ml.revsmap.is_empty());
        assert!(ml.retry_deadline.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_version_dropped_without_new_members() {
        let ctx = MockCtx::new("p0", smap_with_targets(2, "p0", &["t1"]));
        let mut ml = sync_loop(ctx.clone());

        let smap = ctx.smap();
        assert_eq!(
            ml.do_sync(vec![smap_pair(&smap, ACT_REGISTER_TARGET, None)], None)
                .await,
            0
        );
        assert_eq!(ctx.calls_to("t1"), 1);

        // same version again, no new members: no broadcast
        assert_eq!(
            ml.do_sync(vec![smap_pair(&smap, ACT_REGISTER_TARGET, None)], None)
                .await,
            0
        );
        assert_eq!(ctx.calls_to("t1"), 1);
    }

    #[tokio::test]
    async fn test_stale_smap_substituted_with_current() {
        let ctx = MockCtx::new("p0", smap_with_targets(3, "p0", &["t1"]));
        let mut ml = sync_loop(ctx.clone());

        let mut stale = smap_with_targets(3, "p0", &["t1"]);
        stale.version = 1;
        let pair = RevsPair::new(Arc::new(stale) as Arc<dyn Revs>, ActionMsg::new("x", 1, 0));
        assert_eq!(ml.do_sync(vec![pair], None).await, 0);

        let calls = ctx.calls.lock();
        let payload: Payload = serde_json::from_slice(&calls[0].body).unwrap();
        let sent: Smap = serde_json::from_str(&payload[SMAP_TAG]).unwrap();
        assert_eq!(sent.version, 3);
    }

    #[tokio::test]
    async fn test_notify_leaves_registry_untouched() {
        let ctx = MockCtx::new("p0", smap_with_targets(2, "p0", &["t1"]));
        let mut ml = sync_loop(ctx.clone());

        let cnt = ml
            .do_sync(Vec::new(), Some(ActionMsg::new("nudge", 2, 0)))
            .await;
        assert_eq!(cnt, 0);
        assert!(ml.registry.is_empty());
        let calls = ctx.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, Method::POST);
        let msg: ActionMsg = serde_json::from_slice(&calls[0].body).unwrap();
        assert_eq!(msg.action, "nudge");
    }

    #[tokio::test]
    async fn test_non_primary_requests_observably_dropped() {
        // self is a gateway but not the primary
        let mut smap = smap_with_targets(2, "p1", &["t1"]);
        let p0 = snode("p0", NodeRole::Gateway, 8081);
        smap.gateways.insert(p0.id.clone(), p0);
        let ctx = MockCtx::new("p0", smap);

        let (syncer, task) = Metasyncer::spawn(ctx.clone(), sync_config());
        let smap = ctx.smap();
        syncer
            .sync(vec![smap_pair(&smap, ACT_REGISTER_TARGET, None)])
            .await;
        assert_eq!(syncer.sync_wait(vec![smap_pair(&smap, "x", None)]).await, 0);
        syncer.notify(ActionMsg::new("nudge", 2, 0)).await;
        syncer.stop().await;
        task.await.unwrap();

        assert!(ctx.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sync_wait_reports_failed_count() {
        let ctx = MockCtx::new("p0", smap_with_targets(3, "p0", &["t1", "t2"]));
        // a permanent HTTP failure on t1: one failure reported to the caller
        ctx.script_peer("t1", &[Outcome::Status(500); 3]);
        let (syncer, task) = Metasyncer::spawn(ctx.clone(), sync_config());

        let smap = ctx.smap();
        let failed = syncer
            .sync_wait(vec![smap_pair(&smap, ACT_REGISTER_TARGET, None)])
            .await;
        assert_eq!(failed, 1);
        syncer.stop().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_nil_request_resets_without_network_traffic() {
        let ctx = MockCtx::new("p0", smap_with_targets(2, "p0", &["t1"]));
        let mut ml = sync_loop(ctx.clone());

        let smap = ctx.smap();
        ml.do_sync(vec![smap_pair(&smap, ACT_REGISTER_TARGET, None)], None)
            .await;
        assert!(!ml.registry.is_empty());
        let calls_before = ctx.calls.lock().len();

        ml.reset();
        assert!(ml.registry.is_empty());
        assert!(ml.revsmap.is_empty());
        assert!(ml.retry_deadline.is_none());
        assert_eq!(ctx.calls.lock().len(), calls_before);
    }
}
