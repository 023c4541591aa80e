//! Control-plane HTTP API of the target

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::collections::HashMap;
use std::sync::Arc;
use strata_cluster::{BmdOwner, SmapOwner, Snode};
use strata_common::Config;
use strata_sync::{ActionMsg, Payload, RecvHandler};

pub struct AppState {
    pub si: Snode,
    pub config: Arc<Config>,
    pub smap_owner: Arc<SmapOwner>,
    pub bmd_owner: Arc<BmdOwner>,
    pub recv: Arc<RecvHandler>,
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

/// PUT /v1/metasync - replication payload from the primary
pub async fn metasync_put(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Payload>,
) -> Response {
    match state.recv.apply(&payload) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

/// POST /v1/metasync - bare notification from the primary
pub async fn metasync_post(
    State(state): State<Arc<AppState>>,
    Json(msg): Json<ActionMsg>,
) -> StatusCode {
    state.recv.notify(&msg);
    StatusCode::OK
}
