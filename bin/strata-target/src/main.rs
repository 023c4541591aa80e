//! Strata Target - storage server control plane
//!
//! Joins the cluster through the primary gateway, receives metadata
//! replicas over metasync, commits them locally, and reports keepalive.

mod api;
mod persist;

use anyhow::Result;
use api::AppState;
use axum::routing::{get, put};
use axum::Router;
use clap::Parser;
use persist::MetaPersister;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use strata_cluster::{derive_node_id, BmdOwner, Smap, SmapOwner, Snode, TokenOwner};
use strata_common::types::NodeRole;
use strata_common::Config;
use strata_rpc::{join, paths, Caller, RpcClient};
use strata_sync::{KeepaliveReporter, RecvHandler};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata-target")]
#[command(about = "Strata storage target")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Public listening port (overrides net.l4.port)
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.net.l4.port = port;
    }
    config.validate()?;
    let config = Arc::new(config);

    let node_id = derive_node_id(&config.net);
    let si = Snode::from_net_conf(node_id.clone(), NodeRole::Target, &config.net);
    info!(%si, "starting Strata target");

    let smap_owner = Arc::new(SmapOwner::new(Smap::default()));
    let bmd_owner = Arc::new(BmdOwner::default());
    let token_owner = Arc::new(TokenOwner::default());

    let rpc = Arc::new(RpcClient::new(&config.timeout).map_err(|e| anyhow::anyhow!("{e}"))?);
    let caller: Arc<dyn Caller> = rpc.clone();

    let recv = Arc::new(RecvHandler::new(
        si.clone(),
        smap_owner.clone(),
        bmd_owner.clone(),
        token_owner.clone(),
    ));
    recv.subscribe(Arc::new(MetaPersister::new(config.node.data_dir.clone())));

    // register with the primary; a refused handshake is covered by the
    // primary's immediate-retry path once registration goes through
    let smap = smap_owner.get();
    let res = join::join(&caller, &config, &smap, &si).await;
    if let Some(err) = &res.err {
        warn!(%err, "could not join the cluster yet");
    }
    let _reporter_task = KeepaliveReporter::spawn(
        caller.clone(),
        smap_owner.clone(),
        config.clone(),
        si.clone(),
    );

    let state = Arc::new(AppState {
        si,
        config: config.clone(),
        smap_owner,
        bmd_owner,
        recv,
    });

    let app = Router::new()
        .route(paths::HEALTH, get(api::health))
        .route(paths::DAEMON, get(api::daemon_what))
        .route(paths::METASYNC, put(api::metasync_put).post(api::metasync_post))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.net.l4.port));
    info!(%addr, "control plane listening");
    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down...");
        })
        .await?;

    info!("target shut down gracefully");
    Ok(())
}
