use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::{json, Value};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let agents = state.registry.stats();
    Json(json!({
        "status": "ok",
        "agents": {
            "connected": agents.connected,
            "total": agents.total,
        },
        "tasks": state.tasks.count(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
