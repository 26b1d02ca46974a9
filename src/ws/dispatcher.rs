use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use crate::auth::authenticate;
use crate::registry::StreamBinding;
use crate::ws::protocol::{AgentMessage, ServerMessage};
use crate::AppState;

/// Depth of the per-stream outbound channel shared by the ping loop and the
/// task manager; the single writer task drains it onto the socket.
const OUTBOUND_CAPACITY: usize = 64;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/agent", get(agent_ws_upgrade))
}

async fn agent_ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let agent_id = match authenticate(&headers, &state.credentials) {
        Ok(id) => id,
        Err(err) => {
            tracing::warn!(error = %err, "agent stream rejected");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": err.to_string()})),
            )
                .into_response();
        }
    };

    // Fast-path rejection; the register call below stays authoritative.
    if state.registry.is_connected(&agent_id) {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "agent is already connected"})),
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| dispatch_agent_stream(socket, state, agent_id))
}

/// One dispatcher per agent stream: terminates the WebSocket, classifies
/// inbound messages, and owns the single writer draining the outbound
/// channel. Every exit path runs the same cleanup.
async fn dispatch_agent_stream(socket: WebSocket, state: AppState, agent_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let conn_id = uuid::Uuid::new_v4().to_string();
    let cancel = state.shutdown.child_token();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

    let binding = StreamBinding {
        conn_id: conn_id.clone(),
        outbound: tx.clone(),
        cancel: cancel.clone(),
    };
    if state.registry.register(&agent_id, binding).is_err() {
        tracing::warn!(%agent_id, "duplicate stream lost the register race");
        let _ = ws_sender.close().await;
        return;
    }

    // Single writer: wire-level sends never interleave. A send failure
    // means the agent is unreachable, so it tears the dispatcher down.
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(err) => {
                    tracing::error!(error = %err, "outbound serialization failed");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        writer_cancel.cancel();
    });

    state
        .liveness
        .watch(&agent_id, &conn_id, tx.clone(), cancel.clone());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_inbound(&state, &agent_id, &text);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    // Transient receive errors are expected churn; anything
                    // else is worth a loud log before the disconnect.
                    let msg = err.to_string();
                    if msg.contains("reset") || msg.contains("closed") {
                        tracing::debug!(%agent_id, error = %msg, "stream receive ended");
                    } else {
                        tracing::error!(%agent_id, error = %msg, "stream receive failed");
                    }
                    break;
                }
            },
        }
    }

    state.liveness.unwatch(&agent_id, &conn_id);
    state.registry.unregister(&agent_id, &conn_id);
    cancel.cancel();
    drop(tx);
    writer.abort();
}

fn handle_inbound(state: &AppState, agent_id: &str, text: &str) {
    let message: AgentMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(err) => {
            tracing::warn!(agent_id, error = %err, "unrecognized agent message");
            return;
        }
    };

    match message {
        AgentMessage::Pong { ping_ts, .. } => {
            state.liveness.handle_pong(agent_id, ping_ts);
        }
        AgentMessage::TaskResponse(response) => {
            if response.agent_id != agent_id {
                tracing::warn!(
                    agent_id,
                    claimed = %response.agent_id,
                    "response with mismatched agent id dropped"
                );
                return;
            }
            state.tasks.ingest(response);
        }
    }
}
