//! Health and admin/introspection endpoints, grounded on the teacher's
//! `health_handler`/`stats_handler` pair in `main.rs` — plain JSON snapshots
//! behind the same `AppState`, no separate admin auth scope (spec §6 keeps
//! the admin surface bearer-token gated like everything else).

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::GatewayError;
use crate::model::QuotaKey;
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "active_sessions": state.sessions.len(),
    }))
    .into_response()
}

pub async fn capacity_snapshot(State(state): State<AppState>) -> Response {
    Json(json!({ "models": state.capacity.all_snapshots() })).into_response()
}

pub async fn capacity_snapshot_for_model(State(state): State<AppState>, Path(model): Path<String>) -> Response {
    match state.capacity.snapshot(&model) {
        Some(snapshot) => Json(json!(snapshot)).into_response(),
        None => GatewayError::BadRequest(format!("unknown model {model}")).into_response(),
    }
}

pub async fn quota_snapshot(State(state): State<AppState>, Path(account_id): Path<String>) -> Response {
    let key = QuotaKey {
        account_id,
        team_id: None,
        environment: None,
    };
    match state.quota.snapshot(&key).await {
        Some(record) => Json(json!(record)).into_response(),
        None => GatewayError::BadRequest(format!("unknown quota key {}", key.as_string())).into_response(),
    }
}
