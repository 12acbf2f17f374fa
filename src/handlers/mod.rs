//! HTTP surface (spec §6), assembled the way the teacher's `main.rs` builds
//! its `Router`: one module per protocol family, wired onto a shared
//! `AppState` via `axum::extract::State`.

pub mod admin;
pub mod chat;
pub mod messages;
pub mod pipeline;
pub mod responses;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(admin::health))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/responses", post(responses::create_response))
        .route(
            "/v1/responses/:id/submit_tool_outputs",
            post(responses::submit_tool_outputs),
        )
        .route("/v1/messages", post(messages::messages))
        .route("/anthropic/v1/messages", post(messages::messages))
        .route("/v1/messages/count_tokens", post(messages::count_tokens))
        .route("/admin/capacity", get(admin::capacity_snapshot))
        .route("/admin/capacity/:model", get(admin::capacity_snapshot_for_model))
        .route("/admin/quota/:account_id", get(admin::quota_snapshot))
        .with_state(state)
}
