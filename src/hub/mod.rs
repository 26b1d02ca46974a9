mod worker;

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use worker::SseEvent;

/// Callback invoked when a delivery is dropped for one subscriber.
pub type ErrorCallback = Arc<dyn Fn(&str, &HubError) + Send + Sync>;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub intake queue is full")]
    Overflow,
    #[error("subscriber {0} delivery queue is full")]
    SubscriberQueueFull(String),
    #[error("unknown subscriber {0}")]
    UnknownSubscriber(String),
    #[error("hub is closed")]
    Closed,
}

/// Closed set of event kinds the hub fans out. The SSE emitter matches on
/// this exhaustively when framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A task response forwarded from an agent stream.
    Response,
    /// A server-initiated close or failure notice; ends the SSE stream.
    Error,
}

/// An event addressed to a room, a single subscriber, or everyone.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: EventKind,
    pub payload: Value,
    pub room: Option<String>,
    pub subscriber: Option<String>,
}

#[derive(Debug)]
pub(crate) enum HubCommand {
    Subscribe {
        id: String,
        queue: mpsc::Sender<SseEvent>,
    },
    Unsubscribe {
        id: String,
    },
    Join {
        id: String,
        room: String,
    },
    Leave {
        id: String,
        room: String,
    },
    Publish {
        envelope: Envelope,
    },
    BufferRoom {
        room: String,
        capacity: usize,
    },
    DropRoom {
        room: String,
    },
}

/// Fan-out hub. Everything flows through one bounded intake queue drained by
/// a single worker, so room and subscriber bookkeeping never needs external
/// locking. Publishes never block: a full intake returns [`HubError::Overflow`]
/// to the caller, a full subscriber queue drops that one delivery.
#[derive(Clone)]
pub struct Hub {
    intake: mpsc::Sender<HubCommand>,
}

impl Hub {
    pub fn spawn(intake_capacity: usize, shutdown: CancellationToken) -> Self {
        Self::spawn_with_callback(
            intake_capacity,
            shutdown,
            Arc::new(|subscriber, err| {
                tracing::warn!(subscriber, error = %err, "hub subscriber error");
            }),
        )
    }

    pub fn spawn_with_callback(
        intake_capacity: usize,
        shutdown: CancellationToken,
        on_error: ErrorCallback,
    ) -> Self {
        let (intake, rx) = mpsc::channel(intake_capacity.max(1));
        worker::spawn_supervised(rx, shutdown, on_error);
        Self { intake }
    }

    pub async fn subscribe(
        &self,
        id: &str,
        queue: mpsc::Sender<SseEvent>,
    ) -> Result<(), HubError> {
        self.intake
            .send(HubCommand::Subscribe {
                id: id.to_string(),
                queue,
            })
            .await
            .map_err(|_| HubError::Closed)
    }

    pub async fn unsubscribe(&self, id: &str) -> Result<(), HubError> {
        self.intake
            .send(HubCommand::Unsubscribe { id: id.to_string() })
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Non-async removal for drop paths. Best effort.
    pub fn unsubscribe_nowait(&self, id: &str) {
        let _ = self
            .intake
            .try_send(HubCommand::Unsubscribe { id: id.to_string() });
    }

    pub async fn join(&self, id: &str, room: &str) -> Result<(), HubError> {
        self.intake
            .send(HubCommand::Join {
                id: id.to_string(),
                room: room.to_string(),
            })
            .await
            .map_err(|_| HubError::Closed)
    }

    pub async fn leave(&self, id: &str, room: &str) -> Result<(), HubError> {
        self.intake
            .send(HubCommand::Leave {
                id: id.to_string(),
                room: room.to_string(),
            })
            .await
            .map_err(|_| HubError::Closed)
    }

    pub fn send_to_subscriber(
        &self,
        id: &str,
        kind: EventKind,
        payload: Value,
    ) -> Result<(), HubError> {
        self.publish(Envelope {
            kind,
            payload,
            room: None,
            subscriber: Some(id.to_string()),
        })
    }

    pub fn send_to_room(&self, room: &str, kind: EventKind, payload: Value) -> Result<(), HubError> {
        self.publish(Envelope {
            kind,
            payload,
            room: Some(room.to_string()),
            subscriber: None,
        })
    }

    pub fn broadcast(&self, kind: EventKind, payload: Value) -> Result<(), HubError> {
        self.publish(Envelope {
            kind,
            payload,
            room: None,
            subscriber: None,
        })
    }

    /// Retain the last `capacity` envelopes for `room` and replay them to
    /// subscribers joining later.
    pub async fn buffer_room(&self, room: &str, capacity: usize) -> Result<(), HubError> {
        self.intake
            .send(HubCommand::BufferRoom {
                room: room.to_string(),
                capacity,
            })
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Tear a room down: members receive a final `error` event, then the
    /// room and its replay buffer are discarded.
    pub async fn drop_room(&self, room: &str) -> Result<(), HubError> {
        self.intake
            .send(HubCommand::DropRoom {
                room: room.to_string(),
            })
            .await
            .map_err(|_| HubError::Closed)
    }

    fn publish(&self, envelope: Envelope) -> Result<(), HubError> {
        self.intake
            .try_send(HubCommand::Publish { envelope })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => HubError::Overflow,
                mpsc::error::TrySendError::Closed(_) => HubError::Closed,
            })
    }
}
