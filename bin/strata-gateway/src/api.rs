//! Control-plane HTTP API of the gateway

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use strata_cluster::{BmdOwner, BucketProps, Smap, SmapOwner, Snode, TokenOwner};
use strata_common::types::{NodeId, NodeRole};
use strata_common::Config;
use strata_sync::revs::{
    ACT_CREATE_BUCKET, ACT_DESTROY_BUCKET, ACT_REGISTER_GATEWAY, ACT_REGISTER_TARGET,
    ACT_REVOKE_TOKEN, ACT_UNREGISTER,
};
use strata_rpc::LivenessSink;
use strata_sync::{
    ActionMsg, KeepaliveTracker, Metasyncer, Payload, RecvHandler, Revs, RevsPair,
};
use tracing::info;

pub struct AppState {
    pub si: Snode,
    pub config: Arc<Config>,
    pub smap_owner: Arc<SmapOwner>,
    pub bmd_owner: Arc<BmdOwner>,
    pub token_owner: Arc<TokenOwner>,
    pub syncer: Metasyncer,
    pub recv: Arc<RecvHandler>,
    pub keepalive: Arc<KeepaliveTracker>,
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /v1/daemon?what=smap|config|daemon_info|bucketmd
pub async fn daemon_what(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match params.get("what").map(String::as_str) {
        Some("smap") => Json(&*state.smap_owner.get()).into_response(),
        Some("config") => Json(&*state.config).into_response(),
        Some("daemon_info") => Json(&state.si).into_response(),
        Some("bucketmd") => Json(&*state.bmd_owner.get()).into_response(),
        what => (
            StatusCode::BAD_REQUEST,
            format!("invalid daemon GET request: unrecognized what={what:?}"),
        )
            .into_response(),
    }
}

/// PUT /v1/metasync - replication payload
pub async fn metasync_put(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Payload>,
) -> Response {
    match state.recv.apply(&payload) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

/// POST /v1/metasync - bare notification
pub async fn metasync_post(
    State(state): State<Arc<AppState>>,
    Json(msg): Json<ActionMsg>,
) -> StatusCode {
    state.recv.notify(&msg);
    StatusCode::OK
}

/// POST /v1/cluster - target registration
pub async fn register_target(
    State(state): State<Arc<AppState>>,
    Json(node): Json<Snode>,
) -> Response {
    register_node(state, node, NodeRole::Target).await
}

/// POST /v1/cluster/gateway - gateway registration
pub async fn register_gateway(
    State(state): State<Arc<AppState>>,
    Json(node): Json<Snode>,
) -> Response {
    register_node(state, node, NodeRole::Gateway).await
}

/// POST /v1/cluster/keepalive - keepalive report from a member
pub async fn keepalive_report(
    State(state): State<Arc<AppState>>,
    Json(node): Json<Snode>,
) -> StatusCode {
    state.keepalive.heard_from(&node.id);
    StatusCode::OK
}

/// DELETE /v1/cluster/daemon/{id} - unregistration
pub async fn unregister(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let smap = state.smap_owner.get();
    if let Err(resp) = require_primary(&state, &smap) {
        return resp;
    }
    let id = NodeId::new(id);
    let committed = {
        let mut up = state.smap_owner.begin_update();
        let removed =
            up.draft.targets.remove(&id).is_some() || up.draft.gateways.remove(&id).is_some();
        if !removed {
            up.discard();
            None
        } else {
            up.draft.version += 1;
            Some(up.commit())
        }
    };
    let Some(committed) = committed else {
        return (StatusCode::NOT_FOUND, format!("node {id} is not a member")).into_response();
    };
    info!(%id, version = committed.version, "node unregistered");

    let msg = ActionMsg::new(
        ACT_UNREGISTER,
        committed.version,
        state.bmd_owner.get().version,
    );
    state
        .syncer
        .sync(vec![RevsPair::new(
            committed as Arc<dyn Revs>,
            msg,
        )])
        .await;
    StatusCode::OK.into_response()
}

async fn register_node(state: Arc<AppState>, node: Snode, role: NodeRole) -> Response {
    let smap = state.smap_owner.get();
    if let Err(resp) = require_primary(&state, &smap) {
        return resp;
    }
    if node.role != role {
        return (
            StatusCode::BAD_REQUEST,
            format!("wrong role {} for this registration endpoint", node.role),
        )
            .into_response();
    }
    if node.id.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty node ID".to_string()).into_response();
    }

    let new_id = node.id.clone();
    let (rejoined, committed) = {
        let mut up = state.smap_owner.begin_update();
        let rejoined = up.draft.contains(&new_id);
        match role {
            NodeRole::Target => up.draft.targets.insert(new_id.clone(), node),
            NodeRole::Gateway => up.draft.gateways.insert(new_id.clone(), node),
        };
        up.draft.version += 1;
        (rejoined, up.commit())
    };
    info!(id = %new_id, %role, rejoined, version = committed.version, "node registered");

    let action = match role {
        NodeRole::Target => ACT_REGISTER_TARGET,
        NodeRole::Gateway => ACT_REGISTER_GATEWAY,
    };
    let msg = ActionMsg::new(action, committed.version, state.bmd_owner.get().version)
        .with_new_node(new_id);
    state
        .syncer
        .sync(vec![RevsPair::new(
            committed as Arc<dyn Revs>,
            msg,
        )])
        .await;
    StatusCode::OK.into_response()
}

/// PUT /v1/buckets/{name} - create a bucket and replicate the catalog
pub async fn create_bucket(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let smap = state.smap_owner.get();
    if let Err(resp) = require_primary(&state, &smap) {
        return resp;
    }
    let Some(committed) = state
        .bmd_owner
        .modify(|bmd| bmd.add(name.as_str(), BucketProps::default()))
    else {
        return (
            StatusCode::CONFLICT,
            format!("bucket {name} already exists"),
        )
            .into_response();
    };
    info!(bucket = %name, version = committed.version, "bucket created");

    let msg = ActionMsg::new(ACT_CREATE_BUCKET, smap.version, committed.version);
    state
        .syncer
        .sync(vec![RevsPair::new(committed as Arc<dyn Revs>, msg)])
        .await;
    StatusCode::OK.into_response()
}

/// DELETE /v1/buckets/{name} - destroy a bucket and replicate the catalog
pub async fn destroy_bucket(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let smap = state.smap_owner.get();
    if let Err(resp) = require_primary(&state, &smap) {
        return resp;
    }
    let Some(committed) = state.bmd_owner.modify(|bmd| bmd.remove(&name)) else {
        return (StatusCode::NOT_FOUND, format!("bucket {name} not found")).into_response();
    };
    info!(bucket = %name, version = committed.version, "bucket destroyed");

    let msg = ActionMsg::new(ACT_DESTROY_BUCKET, smap.version, committed.version);
    state
        .syncer
        .sync(vec![RevsPair::new(committed as Arc<dyn Revs>, msg)])
        .await;
    StatusCode::OK.into_response()
}

#[derive(Deserialize)]
pub struct RevokeReq {
    pub token: String,
}

/// POST /v1/tokens - revoke a client token cluster-wide
pub async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RevokeReq>,
) -> Response {
    let smap = state.smap_owner.get();
    if let Err(resp) = require_primary(&state, &smap) {
        return resp;
    }
    let committed = state.token_owner.modify(|tokens| tokens.revoke(req.token.clone()));
    info!(version = committed.version, "token revoked");

    let msg = ActionMsg::new(
        ACT_REVOKE_TOKEN,
        smap.version,
        state.bmd_owner.get().version,
    );
    state
        .syncer
        .sync(vec![RevsPair::new(committed as Arc<dyn Revs>, msg)])
        .await;
    StatusCode::OK.into_response()
}

fn require_primary(state: &AppState, smap: &Smap) -> Result<(), Response> {
    if smap.is_primary(&state.si.id) {
        return Ok(());
    }
    Err((
        StatusCode::BAD_REQUEST,
        format!(
            "{} is not the primary (primary={}, cluster map v{})",
            state.si, smap.primary_id, smap.version
        ),
    )
        .into_response())
}
