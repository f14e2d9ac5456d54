use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::config::StoreBackend;
use crate::state::AppState;

/// GET /health
/// Returns a simple status object with service version and store backend.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let store = match state.config.store_backend {
        StoreBackend::Redis => "redis",
        StoreBackend::Memory => "memory",
    };
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "resumeflow",
        "store": store
    }))
}
