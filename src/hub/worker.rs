use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Envelope, ErrorCallback, EventKind, HubCommand, HubError};

/// What a subscriber's delivery queue carries; the SSE emitter turns this
/// into one `event:`/`data:` frame.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub kind: EventKind,
    pub data: Value,
}

struct Subscriber {
    queue: mpsc::Sender<SseEvent>,
    rooms: HashSet<String>,
}

struct Room {
    members: HashSet<String>,
    /// Replay window: `(envelopes, capacity)` when buffering is enabled.
    buffer: Option<(VecDeque<SseEvent>, usize)>,
}

impl Room {
    fn new() -> Self {
        Self {
            members: HashSet::new(),
            buffer: None,
        }
    }
}

#[derive(Default)]
struct HubState {
    subscribers: HashMap<String, Subscriber>,
    rooms: HashMap<String, Room>,
}

/// Spawn the hub worker under a supervisor that restarts it if it panics.
/// State lives outside the worker future so a restart keeps subscriptions.
pub(crate) fn spawn_supervised(
    mut rx: mpsc::Receiver<HubCommand>,
    shutdown: CancellationToken,
    on_error: ErrorCallback,
) {
    let state = Arc::new(Mutex::new(HubState::default()));
    tokio::spawn(async move {
        loop {
            let run = run_worker(&mut rx, state.clone(), on_error.clone(), shutdown.clone());
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(()) => break,
                Err(_) => {
                    tracing::error!("hub worker panicked, restarting");
                }
            }
        }
    });
}

async fn run_worker(
    rx: &mut mpsc::Receiver<HubCommand>,
    state: Arc<Mutex<HubState>>,
    on_error: ErrorCallback,
    shutdown: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };
        handle(&state, &on_error, command);
    }
}

fn handle(state: &Mutex<HubState>, on_error: &ErrorCallback, command: HubCommand) {
    let state = &mut *state.lock();
    match command {
        HubCommand::Subscribe { id, queue } => {
            state.subscribers.insert(
                id,
                Subscriber {
                    queue,
                    rooms: HashSet::new(),
                },
            );
        }
        HubCommand::Unsubscribe { id } => {
            // Removal stays idempotent; an unknown id is still reported.
            match state.subscribers.remove(&id) {
                Some(sub) => {
                    for room_name in sub.rooms {
                        remove_member(&mut state.rooms, &room_name, &id);
                    }
                }
                None => on_error(&id, &HubError::UnknownSubscriber(id.clone())),
            }
        }
        HubCommand::Join { id, room } => {
            let Some(sub) = state.subscribers.get_mut(&id) else {
                on_error(&id, &HubError::UnknownSubscriber(id.clone()));
                return;
            };
            sub.rooms.insert(room.clone());
            let queue = sub.queue.clone();
            let entry = state.rooms.entry(room).or_insert_with(Room::new);
            entry.members.insert(id.clone());
            // Replay before any live event so joiners see history in order.
            if let Some((buffered, _)) = &entry.buffer {
                for event in buffered {
                    deliver(&id, &queue, event.clone(), on_error);
                }
            }
        }
        HubCommand::Leave { id, room } => {
            match state.subscribers.get_mut(&id) {
                Some(sub) => {
                    sub.rooms.remove(&room);
                }
                None => on_error(&id, &HubError::UnknownSubscriber(id.clone())),
            }
            remove_member(&mut state.rooms, &room, &id);
        }
        HubCommand::Publish { envelope } => dispatch(state, on_error, envelope),
        HubCommand::BufferRoom { room, capacity } => {
            let entry = state.rooms.entry(room).or_insert_with(Room::new);
            if entry.buffer.is_none() {
                entry.buffer = Some((VecDeque::with_capacity(capacity), capacity.max(1)));
            }
        }
        HubCommand::DropRoom { room } => {
            let Some(removed) = state.rooms.remove(&room) else {
                return;
            };
            let closing = SseEvent {
                kind: EventKind::Error,
                data: json!({"error": "stream closed", "room": room.as_str()}),
            };
            for member in removed.members {
                if let Some(sub) = state.subscribers.get_mut(&member) {
                    sub.rooms.remove(&room);
                    deliver(&member, &sub.queue, closing.clone(), on_error);
                }
            }
        }
    }
}

fn dispatch(state: &mut HubState, on_error: &ErrorCallback, envelope: Envelope) {
    let event = SseEvent {
        kind: envelope.kind,
        data: envelope.payload,
    };

    if let Some(id) = envelope.subscriber {
        if let Some(sub) = state.subscribers.get(&id) {
            deliver(&id, &sub.queue, event, on_error);
        }
        return;
    }

    if let Some(room_name) = envelope.room {
        let Some(room) = state.rooms.get_mut(&room_name) else {
            return;
        };
        if let Some((buffered, capacity)) = &mut room.buffer {
            if buffered.len() == *capacity {
                buffered.pop_front();
            }
            buffered.push_back(event.clone());
        }
        for member in &room.members {
            if let Some(sub) = state.subscribers.get(member) {
                deliver(member, &sub.queue, event.clone(), on_error);
            }
        }
        return;
    }

    for (id, sub) in &state.subscribers {
        deliver(id, &sub.queue, event.clone(), on_error);
    }
}

/// One full subscriber queue drops that delivery only; other subscribers
/// are unaffected and the subscriber itself is kept.
fn deliver(id: &str, queue: &mpsc::Sender<SseEvent>, event: SseEvent, on_error: &ErrorCallback) {
    if let Err(err) = queue.try_send(event) {
        match err {
            mpsc::error::TrySendError::Full(_) => {
                on_error(id, &HubError::SubscriberQueueFull(id.to_string()));
            }
            mpsc::error::TrySendError::Closed(_) => {
                tracing::debug!(subscriber = %id, "delivery to closed subscriber queue");
            }
        }
    }
}

/// Drop the room once its last member leaves, unless a replay buffer keeps
/// it alive for late joiners.
fn remove_member(rooms: &mut HashMap<String, Room>, room_name: &str, id: &str) {
    let Some(room) = rooms.get_mut(room_name) else {
        return;
    };
    room.members.remove(id);
    if room.members.is_empty() && room.buffer.is_none() {
        rooms.remove(room_name);
    }
}
