use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// Liveness probe; intentionally skips the response envelope.
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
