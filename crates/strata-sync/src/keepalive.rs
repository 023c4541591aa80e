//! Keepalive: liveness tracking and eviction
//!
//! The primary gateway runs the [`KeepaliveTracker`]: every interval it
//! walks the membership, re-probes peers that have gone quiet, and evicts
//! from the cluster map (one CoW update per peer, handed to the metasyncer)
//! whoever stays silent past the timeout window. Per peer:
//!
//! - **alive** - last success within `interval * factor`; left alone
//! - **suspect** - probe failed; re-probed with backoff bounded by
//!   `retry_factor * interval`
//! - **dead** - `timeout_factor * interval` elapsed without success;
//!   evicted
//!
//! Successful control-plane calls count as liveness: the peer caller
//! reports them through [`LivenessSink::heard_from`], which resets the
//! peer without a probe. Timestamps are updated with a monotonic max so
//! concurrent reports cannot move a peer backwards in time.
//!
//! Every other node runs the [`KeepaliveReporter`], which periodically
//! re-posts its descriptor to the primary.

use crate::metasync::Metasyncer;
use crate::revs::{ActionMsg, Revs, RevsPair, ACT_KEEPALIVE_EVICT};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_cluster::{Smap, SmapOwner, Snode};
use strata_common::config::{Config, KeepaliveConf, KEEPALIVE_AVERAGE};
use strata_common::types::NodeId;
use strata_rpc::join::{primary_url_and_si, register_to_url};
use strata_rpc::{paths, CallArgs, CallTimeout, Caller, LivenessSink, Method, ReqArgs};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Tracker flavor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Variant {
    /// Fixed probe interval
    Heartbeat,
    /// Probe interval stretched by the EWMA of observed RTTs
    Average,
}

struct PeerLiveness {
    /// Milliseconds since tracker start; updated with `fetch_max`
    last_heard_ms: AtomicU64,
    /// EWMA of probe round-trips, microseconds; `average` flavor only
    ewma_rtt_us: AtomicU64,
}

/// Damped moving average of probe round-trips
fn update_ewma(prev_us: u64, sample_us: u64, factor: u8) -> u64 {
    let factor = u64::from(factor.max(1));
    if prev_us == 0 {
        sample_us
    } else {
        (prev_us * (factor - 1) + sample_us) / factor
    }
}

/// Primary-side liveness tracker
pub struct KeepaliveTracker {
    variant: Variant,
    interval: Duration,
    factor: u8,
    retry_factor: u8,
    timeout_factor: u8,
    epoch: Instant,
    peers: RwLock<HashMap<NodeId, Arc<PeerLiveness>>>,
}

impl KeepaliveTracker {
    pub fn new(conf: &KeepaliveConf) -> Self {
        let variant = if conf.gateway.name == KEEPALIVE_AVERAGE {
            Variant::Average
        } else {
            Variant::Heartbeat
        };
        Self {
            variant,
            interval: conf.gateway.interval(),
            factor: conf.gateway.factor.max(1),
            retry_factor: conf.retry_factor.max(1),
            timeout_factor: conf.timeout_factor.max(1),
            epoch: Instant::now(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn peer(&self, id: &NodeId) -> Arc<PeerLiveness> {
        if let Some(peer) = self.peers.read().get(id) {
            return peer.clone();
        }
        let mut peers = self.peers.write();
        peers
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(PeerLiveness {
                    // a first sighting gets a full liveness window
                    last_heard_ms: AtomicU64::new(self.epoch.elapsed().as_millis() as u64),
                    ewma_rtt_us: AtomicU64::new(0),
                })
            })
            .clone()
    }

    fn record_rtt(&self, id: &NodeId, rtt: Duration) {
        if self.variant != Variant::Average {
            return;
        }
        let peer = self.peer(id);
        let sample = rtt.as_micros() as u64;
        let prev = peer.ewma_rtt_us.load(Ordering::Relaxed);
        peer.ewma_rtt_us
            .store(update_ewma(prev, sample, self.factor), Ordering::Relaxed);
    }

    /// The probe-loop period; the `average` flavor stretches it by the
    /// slowest peer's damped RTT
    pub fn probe_interval(&self) -> Duration {
        match self.variant {
            Variant::Heartbeat => self.interval,
            Variant::Average => {
                let slowest = self
                    .peers
                    .read()
                    .values()
                    .map(|p| p.ewma_rtt_us.load(Ordering::Relaxed))
                    .max()
                    .unwrap_or(0);
                self.interval + Duration::from_micros(slowest)
            }
        }
    }

    /// Drop state for peers that left the membership
    fn prune(&self, smap: &Smap) {
        self.peers.write().retain(|id, _| smap.contains(id));
    }

    async fn probe(&self, caller: &Arc<dyn Caller>, si: &Snode) -> bool {
        let start = Instant::now();
        let res = caller
            .call(CallArgs {
                si: Some(si.clone()),
                req: ReqArgs {
                    method: Method::GET,
                    path: paths::HEALTH.to_string(),
                    ..Default::default()
                },
                timeout: CallTimeout::Default,
            })
            .await;
        if res.is_ok() {
            self.record_rtt(&si.id, start.elapsed());
            self.heard_from(&si.id);
            return true;
        }
        false
    }

    /// One pass over the membership: probe the quiet, evict the dead
    ///
    /// Only the primary polls; on any other node a tick is a no-op.
    pub async fn tick(
        &self,
        caller: &Arc<dyn Caller>,
        owner: &Arc<SmapOwner>,
        syncer: &Metasyncer,
        self_id: &NodeId,
    ) {
        let smap = owner.get();
        if !smap.is_primary(self_id) {
            return;
        }
        self.prune(&smap);

        let alive_window = self.interval * u32::from(self.factor);
        let dead_window = self.interval * u32::from(self.timeout_factor);
        let backoff_budget = self.interval * u32::from(self.retry_factor);

        for si in smap.iter_nodes() {
            if &si.id == self_id {
                continue;
            }
            let peer = self.peer(&si.id);
            let age = Duration::from_millis(
                self.now_ms()
                    .saturating_sub(peer.last_heard_ms.load(Ordering::Relaxed)),
            );
            if age < alive_window {
                continue;
            }

            // suspect: re-probe with growing backoff, bounded
            if self.probe(caller, si).await {
                continue;
            }
            let mut backoff = self.interval / u32::from(self.retry_factor);
            let mut spent = Duration::ZERO;
            let mut recovered = false;
            while spent + backoff <= backoff_budget {
                tokio::time::sleep(backoff).await;
                spent += backoff;
                backoff = (backoff * 2).min(backoff_budget);
                if self.probe(caller, si).await {
                    recovered = true;
                    break;
                }
            }
            if recovered {
                continue;
            }

            let age = Duration::from_millis(
                self.now_ms()
                    .saturating_sub(peer.last_heard_ms.load(Ordering::Relaxed)),
            );
            if age >= dead_window {
                self.evict(si, owner, syncer).await;
            }
        }
    }

    /// Remove a dead peer from the cluster map and metasync the change
    async fn evict(&self, si: &Snode, owner: &Arc<SmapOwner>, syncer: &Metasyncer) {
        let committed = {
            let mut up = owner.begin_update();
            let removed = up.draft.targets.remove(&si.id).is_some()
                || up.draft.gateways.remove(&si.id).is_some();
            if !removed {
                up.discard();
                None
            } else {
                up.draft.version += 1;
                Some(up.commit())
            }
        };
        let committed = match committed {
            Some(committed) => committed,
            None => return,
        };
        warn!(peer = %si, version = committed.version, "keepalive: peer evicted");
        self.peers.write().remove(&si.id);

        let msg = ActionMsg::new(ACT_KEEPALIVE_EVICT, committed.version, 0);
        syncer
            .sync(vec![RevsPair::new(committed as Arc<dyn Revs>, msg)])
            .await;
    }

    /// Run the probe loop on its own scheduler
    pub fn spawn(
        self: Arc<Self>,
        caller: Arc<dyn Caller>,
        owner: Arc<SmapOwner>,
        syncer: Metasyncer,
        self_id: NodeId,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("keepalive tracker started");
            loop {
                tokio::time::sleep(self.probe_interval()).await;
                self.tick(&caller, &owner, &syncer, &self_id).await;
            }
        })
    }
}

impl LivenessSink for KeepaliveTracker {
    fn heard_from(&self, id: &NodeId) {
        let now = self.now_ms();
        self.peer(id).last_heard_ms.fetch_max(now, Ordering::AcqRel);
    }
}

/// Non-primary side: periodically re-post this node's descriptor to the
/// primary so its tracker keeps seeing us
pub struct KeepaliveReporter;

impl KeepaliveReporter {
    pub fn spawn(
        caller: Arc<dyn Caller>,
        owner: Arc<SmapOwner>,
        config: Arc<Config>,
        si: Snode,
    ) -> JoinHandle<()> {
        let interval = config.keepalive.target.interval();
        tokio::spawn(async move {
            info!("keepalive reporter started");
            loop {
                tokio::time::sleep(interval).await;
                let smap = owner.get();
                if smap.is_primary(&si.id) {
                    continue;
                }
                let (url, psi) = primary_url_and_si(&config, &smap);
                if url.is_empty() {
                    warn!("keepalive: no primary to report to");
                    continue;
                }
                let res = register_to_url(&caller, &url, psi.as_ref(), &si, true).await;
                if let Some(err) = res.err {
                    warn!(%url, %err, "keepalive report failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metasync::{SyncConfig, SyncCtx};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use strata_cluster::NetInfo;
    use strata_common::types::NodeRole;
    use strata_rpc::{BcastArgs, CallResult, RpcError};
    use tokio::sync::mpsc;

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

    /// Capability context bound to the live owner; counts broadcasts
    struct OwnerCtx {
        owner: Arc<SmapOwner>,
        self_id: NodeId,
        broadcasts: AtomicUsize,
    }

    impl SyncCtx for OwnerCtx {
        fn smap(&self) -> Arc<Smap> {
            self.owner.get()
        }

        fn self_id(&self) -> &NodeId {
            &self.self_id
        }

        fn broadcast(&self, _args: BcastArgs) -> mpsc::Receiver<CallResult> {
            self.broadcasts.fetch_add(1, Ordering::Relaxed);
            let (_tx, rx) = mpsc::channel(1);
            rx
        }
    }

    /// Always answers the scripted way
    struct FixedCaller {
        ok: bool,
        probes: Mutex<Vec<NodeId>>,
    }

    #[async_trait]
    impl Caller for FixedCaller {
        async fn call(&self, args: CallArgs) -> CallResult {
            let si = args.si.unwrap();
            self.probes.lock().push(si.id.clone());
            if self.ok {
                CallResult {
                    si: Some(si),
                    ..Default::default()
                }
            } else {
                CallResult::failed(Some(si), RpcError::Refused("connect".to_string()))
            }
        }
    }

    fn conf(interval_ms: u64) -> KeepaliveConf {
        let mut conf = KeepaliveConf::default();
        conf.gateway.interval_ms = interval_ms;
        conf
    }

    fn cluster(owner_primary: &str, target: &str) -> (Arc<SmapOwner>, Metasyncer, Arc<OwnerCtx>) {
        let mut smap = Smap::bootstrap(snode(owner_primary, NodeRole::Gateway, 8080));
        let t = snode(target, NodeRole::Target, 9001);
        smap.targets.insert(t.id.clone(), t);
        smap.version = 2;
        let owner = Arc::new(SmapOwner::new(smap));
        let ctx = Arc::new(OwnerCtx {
            owner: owner.clone(),
            self_id: NodeId::new(owner_primary),
            broadcasts: AtomicUsize::new(0),
        });
        let (syncer, _task) = Metasyncer::spawn(
            ctx.clone(),
            SyncConfig {
                cplane_operation: Duration::from_millis(10),
                max_keepalive: Duration::from_millis(40),
                retry_sync_time: Duration::from_millis(50),
            },
        );
        (owner, syncer, ctx)
    }

    #[test]
    fn test_ewma_damping() {
        assert_eq!(update_ewma(0, 900, 3), 900);
        assert_eq!(update_ewma(900, 300, 3), 700);
        assert_eq!(update_ewma(700, 700, 3), 700);
        // factor 1 tracks the latest sample exactly
        assert_eq!(update_ewma(500, 100, 1), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_interval_stretches_for_average_flavor() {
        let mut kconf = conf(1_000);
        kconf.gateway.name = KEEPALIVE_AVERAGE.to_string();
        let tracker = KeepaliveTracker::new(&kconf);
        assert_eq!(tracker.probe_interval(), Duration::from_millis(1_000));

        tracker.record_rtt(&NodeId::new("t1"), Duration::from_millis(90));
        assert!(tracker.probe_interval() > Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_interval_is_fixed() {
        let tracker = KeepaliveTracker::new(&conf(1_000));
        tracker.record_rtt(&NodeId::new("t1"), Duration::from_millis(90));
        assert_eq!(tracker.probe_interval(), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_peers_are_not_probed() {
        let (owner, syncer, _ctx) = cluster("p0", "t1");
        let tracker = KeepaliveTracker::new(&conf(1_000));
        let fixed = Arc::new(FixedCaller {
            ok: true,
            probes: Mutex::new(Vec::new()),
        });
        let caller: Arc<dyn Caller> = fixed.clone();

        // first sighting starts the liveness window; nothing to probe yet
        tracker
            .tick(&caller, &owner, &syncer, &NodeId::new("p0"))
            .await;
        assert!(fixed.probes.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_responsive_peer_survives() {
        let (owner, syncer, ctx) = cluster("p0", "t1");
        let tracker = KeepaliveTracker::new(&conf(1_000));
        let fixed = Arc::new(FixedCaller {
            ok: true,
            probes: Mutex::new(Vec::new()),
        });
        let caller: Arc<dyn Caller> = fixed.clone();
        let self_id = NodeId::new("p0");

        tracker.tick(&caller, &owner, &syncer, &self_id).await;
        // go silent past the alive window, but the probe succeeds
        tokio::time::sleep(Duration::from_secs(10)).await;
        tracker.tick(&caller, &owner, &syncer, &self_id).await;

        assert_eq!(fixed.probes.lock().len(), 1);
        assert_eq!(owner.get().version, 2);
        assert_eq!(ctx.broadcasts.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_evicted_with_one_version_bump() {
        let (owner, syncer, ctx) = cluster("p0", "t1");
        let tracker = KeepaliveTracker::new(&conf(1_000));
        let fixed = Arc::new(FixedCaller {
            ok: false,
            probes: Mutex::new(Vec::new()),
        });
        let caller: Arc<dyn Caller> = fixed.clone();
        let self_id = NodeId::new("p0");

        tracker.tick(&caller, &owner, &syncer, &self_id).await;
        // silent far past the dead window
        tokio::time::sleep(Duration::from_secs(10)).await;
        tracker.tick(&caller, &owner, &syncer, &self_id).await;

        let smap = owner.get();
        assert_eq!(smap.version, 3);
        assert!(!smap.contains(&NodeId::new("t1")));
        assert!(fixed.probes.lock().len() > 1);

        // the membership change went to the metasyncer
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ctx.broadcasts.load(Ordering::Relaxed) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_primary_tick_is_noop() {
        let (owner, syncer, _ctx) = cluster("p0", "t1");
        let tracker = KeepaliveTracker::new(&conf(1_000));
        let fixed = Arc::new(FixedCaller {
            ok: false,
            probes: Mutex::new(Vec::new()),
        });
        let caller: Arc<dyn Caller> = fixed.clone();

        tokio::time::sleep(Duration::from_secs(10)).await;
        tracker
            .tick(&caller, &owner, &syncer, &NodeId::new("t1"))
            .await;
        assert!(fixed.probes.lock().is_empty());
        assert_eq!(owner.get().version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heard_from_resets_liveness_without_probe() {
        let (owner, syncer, _ctx) = cluster("p0", "t1");
        let tracker = KeepaliveTracker::new(&conf(1_000));
        let fixed = Arc::new(FixedCaller {
            ok: false,
            probes: Mutex::new(Vec::new()),
        });
        let caller: Arc<dyn Caller> = fixed.clone();
        let self_id = NodeId::new("p0");

        tracker.tick(&caller, &owner, &syncer, &self_id).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        // a successful control-plane call just reported in
        tracker.heard_from(&NodeId::new("t1"));
        tracker.tick(&caller, &owner, &syncer, &self_id).await;

        assert!(fixed.probes.lock().is_empty());
        assert!(owner.get().contains(&NodeId::new("t1")));
    }
}
