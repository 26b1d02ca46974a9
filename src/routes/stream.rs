use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::hub::{EventKind, Hub};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/stream", get(subscribe_stream))
}

#[derive(Deserialize)]
struct StreamQuery {
    /// Room to join; in practice a task ID.
    #[serde(rename = "ref")]
    reference: String,
}

/// Returns the hub subscription for one task as `text/event-stream`. Each
/// hub delivery becomes one SSE frame; a server-initiated close is signalled
/// by a final `error` event.
async fn subscribe_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    if state.tasks.get(&query.reference).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "task not found"})),
        )
            .into_response();
    }

    let subscriber_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel(state.config.subscriber_buffer.max(1));

    if state.hub.subscribe(&subscriber_id, tx).await.is_err()
        || state.hub.join(&subscriber_id, &query.reference).await.is_err()
    {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "subscription failed"})),
        )
            .into_response();
    }

    tracing::debug!(subscriber = %subscriber_id, room = %query.reference, "sse subscriber joined");

    let guard = SubscriptionGuard {
        hub: state.hub.clone(),
        subscriber_id,
    };
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            let name = match event.kind {
                EventKind::Response => "response",
                EventKind::Error => "error",
            };
            yield Ok::<Event, Infallible>(
                Event::default().event(name).data(event.data.to_string()),
            );
            if event.kind == EventKind::Error {
                break;
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// Unsubscribes when the SSE stream is dropped, whichever side closed it.
struct SubscriptionGuard {
    hub: Hub,
    subscriber_id: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.hub.unsubscribe_nowait(&self.subscriber_id);
    }
}
