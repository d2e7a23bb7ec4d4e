use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::app::AppState;

/// GET /health: liveness plus a small operational snapshot.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let heartbeats: Vec<Value> = state
        .heartbeat
        .events()
        .into_iter()
        .map(|(session, evt)| json!({ "session": session, "ts": evt.ts, "status": evt.status }))
        .collect();

    Json(json!({
        "status": "ok",
        "sessions": state.sessions.len(),
        "active_runs": state.coordinator.active_count(),
        "gate_rejections": state.gate_rejections.load(std::sync::atomic::Ordering::Relaxed),
        "heartbeats": heartbeats,
    }))
}
