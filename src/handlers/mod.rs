mod fetch;
mod health;
mod metrics;

pub use fetch::{cancel_handler, status_handler, trigger_handler};
pub use health::health_handler;
pub use metrics::metrics_handler;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/fetch", post(trigger_handler))
        .route("/accounts/{username}/cancel", post(cancel_handler))
        .with_state(state)
}
