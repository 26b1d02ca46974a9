use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::registry::AgentStatus;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/agents", get(list_agents))
        .route("/agents/{id}", get(get_agent))
}

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
}

async fn list_agents(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
    let filter = match query.status.as_deref() {
        None => None,
        Some("connected") => Some(AgentStatus::Connected),
        Some("disconnected") => Some(AgentStatus::Disconnected),
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("unknown status filter: {}", other)})),
            )
                .into_response();
        }
    };

    let agents = state.registry.list(filter);
    Json(json!({"agents": agents})).into_response()
}

async fn get_agent(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id) {
        Some(agent) => Json(agent).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "agent not found"})),
        )
            .into_response(),
    }
}
