use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::tasks::TaskError;
use crate::ws::protocol::TaskPayload;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks/shell", post(submit_shell))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task).delete(cancel_task))
        .route("/agents/{id}/tasks", get(agent_tasks))
}

#[derive(Deserialize)]
struct ShellTaskBody {
    agent_id: String,
    cmd: String,
    /// Seconds; zero or absent falls back to the server default.
    timeout: Option<u64>,
}

async fn submit_shell(
    State(state): State<AppState>,
    Json(body): Json<ShellTaskBody>,
) -> Response {
    let agent_id = body.agent_id.trim();
    let cmd = body.cmd.trim();
    if agent_id.is_empty() || cmd.is_empty() {
        return task_error_response(TaskError::InvalidPayload(
            "agent_id and cmd are required".into(),
        ));
    }

    let payload = TaskPayload::ShellExecute {
        cmd: cmd.to_string(),
        timeout_secs: body.timeout,
    };
    let timeout = body.timeout.map(Duration::from_secs);

    match state.tasks.submit(agent_id, payload, timeout).await {
        Ok(task) => (
            StatusCode::CREATED,
            Json(json!({
                "task_id": task.task_id,
                "agent_id": task.agent_id,
                "status": task.status,
                "created_at": task.created_at,
            })),
        )
            .into_response(),
        Err(err) => task_error_response(err),
    }
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.tasks.get(&id) {
        Some(task) => Json(task).into_response(),
        None => task_error_response(TaskError::NotFound),
    }
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.tasks.cancel(&id) {
        Ok(()) => Json(json!({"message": "task cancelled"})).into_response(),
        Err(err) => task_error_response(err),
    }
}

async fn list_tasks(State(state): State<AppState>) -> Response {
    Json(json!({"tasks": state.tasks.list(None)})).into_response()
}

async fn agent_tasks(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    Json(json!({
        "agent_id": id,
        "tasks": state.tasks.list(Some(&id)),
    }))
    .into_response()
}

fn task_error_response(err: TaskError) -> Response {
    let status = match err {
        TaskError::AgentNotConnected => StatusCode::CONFLICT,
        TaskError::NotFound => StatusCode::NOT_FOUND,
        TaskError::AlreadyTerminal => StatusCode::CONFLICT,
        TaskError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        TaskError::Transport(_) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}
