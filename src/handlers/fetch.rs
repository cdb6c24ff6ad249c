use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use crate::models::normalize_username;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct TriggerParams {
    #[serde(default)]
    full: bool,
}

// POST /fetch?full=true starts a batch in the background
pub async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TriggerParams>,
) -> (StatusCode, Json<Value>) {
    if state.is_running() {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "a fetch batch is already running"})),
        );
    }

    info!(full_refresh = params.full, "Fetch triggered over HTTP");
    let background = Arc::clone(&state);
    tokio::spawn(async move {
        background.run_once(params.full).await;
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "started", "full_refresh": params.full})),
    )
}

pub async fn status_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let last = state.last_report().await;
    Json(json!({
        "running": state.is_running(),
        "posts": state.store.post_count(),
        "last_batch": last.map(|report| json!({
            "started_at": report.started_at,
            "finished_at": report.finished_at,
            "succeeded": report.succeeded(),
            "failed": report.failed(),
            "accounts": report.accounts,
        })),
    }))
}

pub async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> (StatusCode, Json<Value>) {
    let username = normalize_username(&username);
    if state.cancel(&username).await {
        info!(username = %username, "Cancellation requested");
        (StatusCode::ACCEPTED, Json(json!({"cancelled": username})))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("{} is not being fetched", username)})),
        )
    }
}
