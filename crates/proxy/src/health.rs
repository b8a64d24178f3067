use crate::AppState;
use axum::extract::State;
use axum::Json;
use proxy_core::time::now_secs;
use serde_json::{json, Value};
use std::sync::Arc;

/// Liveness/readiness snapshot (ambient addition, grounded in the
/// teacher's gateway `/health` route). Reports process uptime and which
/// backends are currently configured; does not probe them synchronously on
/// every call, to keep `/health` cheap.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime_secs = now_secs().saturating_sub(state.started_at);
    let backends: Vec<Value> = state
        .backends
        .iter()
        .map(|(id, adapter)| json!({ "backend_id": id, "n_slots": adapter.n_slots() }))
        .collect();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime_secs,
        "backends": backends,
    }))
}
