use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::hub::{EventKind, Hub};
use crate::registry::{AgentRegistry, RegistryEvent};
use crate::tasks::{next_status, TaskError, TaskRecord, TaskSnapshot, TaskStatus};
use crate::ws::protocol::{ServerMessage, TaskPayload, TaskRequest, TaskResponse};

#[derive(Clone, Debug)]
pub struct TaskManagerConfig {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub completed_ttl: Duration,
    pub cleanup_interval: Duration,
    pub cleanup_grace: Duration,
    pub streaming_cleanup_grace: Duration,
    pub room_buffer: usize,
}

impl TaskManagerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_timeout: config.default_task_timeout,
            max_timeout: config.max_task_timeout,
            completed_ttl: config.completed_task_ttl,
            cleanup_interval: config.task_cleanup_interval,
            cleanup_grace: config.cleanup_grace,
            streaming_cleanup_grace: config.streaming_cleanup_grace,
            room_buffer: config.room_buffer,
        }
    }
}

/// Owns the task table. External code passes task IDs, never references;
/// every mutation happens under the table's own entry lock, and each task
/// reaches at most one terminal state.
#[derive(Clone)]
pub struct TaskManager {
    tasks: Arc<DashMap<String, TaskRecord>>,
    registry: AgentRegistry,
    hub: Hub,
    config: TaskManagerConfig,
    shutdown: CancellationToken,
}

impl TaskManager {
    pub fn new(
        registry: AgentRegistry,
        hub: Hub,
        config: TaskManagerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            registry,
            hub,
            config,
            shutdown,
        }
    }

    /// Start the cleanup sweep and the registry disconnect listener.
    pub fn run_background(&self) {
        self.spawn_cleanup_sweeper();
        self.spawn_disconnect_listener();
    }

    /// Create a task, hand it to the agent's stream, and return a snapshot.
    /// Requested timeouts of zero fall back to the default; oversized ones
    /// are clamped to the maximum.
    pub async fn submit(
        &self,
        agent_id: &str,
        payload: TaskPayload,
        requested_timeout: Option<Duration>,
    ) -> Result<TaskSnapshot, TaskError> {
        let timeout = self.clamp_timeout(requested_timeout);
        let outbound = self
            .registry
            .outbound_sender(agent_id)
            .ok_or(TaskError::AgentNotConnected)?;

        let task_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let cancel = self.shutdown.child_token();
        self.tasks.insert(
            task_id.clone(),
            TaskRecord {
                agent_id: agent_id.to_string(),
                payload: payload.clone(),
                status: TaskStatus::Created,
                created_at: now,
                updated_at: now,
                timeout,
                cancel: cancel.clone(),
                last_response: None,
                failure_reason: None,
            },
        );

        // Buffer the room before handoff so responses racing the subscribe
        // are retained for replay.
        let _ = self.hub.buffer_room(&task_id, self.config.room_buffer).await;

        let request = ServerMessage::Task(TaskRequest {
            agent_id: agent_id.to_string(),
            task_id: task_id.clone(),
            payload,
        });
        if outbound.send(request).await.is_err() {
            self.mark_failed(&task_id, "stream send failed");
            return Err(TaskError::Transport("stream send failed".into()));
        }

        if let Some(mut rec) = self.tasks.get_mut(&task_id) {
            rec.status = TaskStatus::Sent;
            rec.updated_at = Utc::now();
        }
        self.spawn_timeout_monitor(task_id.clone(), timeout, cancel);

        tracing::info!(%task_id, agent_id, timeout_secs = timeout.as_secs(), "task submitted");
        self.get(&task_id).ok_or(TaskError::NotFound)
    }

    /// Ingest a response received from an agent's stream. Unknown and
    /// already-terminal tasks drop the response; that is not an error.
    pub fn ingest(&self, response: TaskResponse) {
        let task_id = response.task_id.clone();
        let (streaming, schedule_grace) = {
            let Some(mut rec) = self.tasks.get_mut(&task_id) else {
                tracing::debug!(%task_id, "response for unknown task dropped");
                return;
            };
            if rec.status.is_terminal() {
                tracing::debug!(%task_id, status = ?rec.status, "late response dropped");
                return;
            }
            rec.last_response = Some(response.clone());
            rec.updated_at = Utc::now();
            if let Some(next) = next_status(&response) {
                rec.status = next;
                if next.is_terminal() {
                    rec.cancel.cancel();
                    if next == TaskStatus::Failed {
                        rec.failure_reason = Some("agent reported failure".into());
                    }
                }
            }
            (rec.payload.is_streaming(), response.is_final)
        };

        match serde_json::to_value(&response) {
            Ok(payload) => {
                if let Err(err) = self.hub.send_to_room(&task_id, EventKind::Response, payload) {
                    tracing::warn!(%task_id, error = %err, "failed to publish response");
                }
            }
            Err(err) => tracing::error!(%task_id, error = %err, "response serialization failed"),
        }

        if schedule_grace {
            let grace = if streaming {
                self.config.streaming_cleanup_grace
            } else {
                self.config.cleanup_grace
            };
            self.schedule_cleanup(&task_id, grace);
        }
    }

    /// Flip a task to cancelled and tell the agent, best effort. The agent's
    /// acknowledgement later arrives as a normal response and is dropped by
    /// the terminal check in [`TaskManager::ingest`].
    pub fn cancel(&self, task_id: &str) -> Result<(), TaskError> {
        let agent_id = {
            let mut rec = self.tasks.get_mut(task_id).ok_or(TaskError::NotFound)?;
            if rec.status.is_terminal() {
                return Err(TaskError::AlreadyTerminal);
            }
            rec.status = TaskStatus::Cancelled;
            rec.updated_at = Utc::now();
            rec.cancel.cancel();
            rec.agent_id.clone()
        };

        if let Some(outbound) = self.registry.outbound_sender(&agent_id) {
            let request = ServerMessage::Task(TaskRequest {
                agent_id: agent_id.clone(),
                task_id: task_id.to_string(),
                payload: TaskPayload::TaskCancel {},
            });
            if outbound.try_send(request).is_err() {
                tracing::debug!(task_id, %agent_id, "cancel request not delivered");
            }
        }
        tracing::info!(task_id, %agent_id, "task cancelled");
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.tasks.get(task_id).map(|rec| snapshot(task_id, &rec))
    }

    pub fn list(&self, agent_id: Option<&str>) -> Vec<TaskSnapshot> {
        self.tasks
            .iter()
            .filter(|entry| agent_id.map(|a| entry.agent_id == a).unwrap_or(true))
            .map(|entry| snapshot(entry.key(), entry.value()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.tasks.len()
    }

    /// Fail every non-terminal task targeting `agent_id`. Used when the
    /// agent goes offline.
    pub fn fail_tasks_for(&self, agent_id: &str, reason: &str) {
        let affected: Vec<String> = self
            .tasks
            .iter()
            .filter(|e| e.agent_id == agent_id && !e.status.is_terminal())
            .map(|e| e.key().clone())
            .collect();
        for task_id in affected {
            self.mark_failed(&task_id, reason);
            let _ = self.hub.send_to_room(
                &task_id,
                EventKind::Error,
                serde_json::json!({"task_id": task_id, "error": reason}),
            );
            self.schedule_cleanup(&task_id, self.config.cleanup_grace);
        }
    }

    fn clamp_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            None => self.config.default_timeout,
            Some(d) if d.is_zero() => self.config.default_timeout,
            Some(d) if d > self.config.max_timeout => self.config.max_timeout,
            Some(d) => d,
        }
    }

    fn mark_failed(&self, task_id: &str, reason: &str) {
        if let Some(mut rec) = self.tasks.get_mut(task_id) {
            if rec.status.is_terminal() {
                return;
            }
            rec.status = TaskStatus::Failed;
            rec.failure_reason = Some(reason.to_string());
            rec.updated_at = Utc::now();
            rec.cancel.cancel();
            tracing::warn!(task_id, reason, "task failed");
        }
    }

    fn spawn_timeout_monitor(&self, task_id: String, timeout: Duration, cancel: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => manager.expire(&task_id),
            }
        });
    }

    fn expire(&self, task_id: &str) {
        {
            let Some(mut rec) = self.tasks.get_mut(task_id) else {
                return;
            };
            if rec.status.is_terminal() {
                return;
            }
            rec.status = TaskStatus::Timeout;
            rec.updated_at = Utc::now();
            rec.cancel.cancel();
            tracing::warn!(task_id, "task deadline exceeded");
        }
        self.schedule_cleanup(task_id, self.config.cleanup_grace);
    }

    fn schedule_cleanup(&self, task_id: &str, delay: Duration) {
        let manager = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.evict(&task_id).await;
        });
    }

    async fn evict(&self, task_id: &str) {
        if self.tasks.remove(task_id).is_some() {
            let _ = self.hub.drop_room(task_id).await;
            tracing::debug!(task_id, "task evicted");
        }
    }

    fn spawn_cleanup_sweeper(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let run = manager.run_cleanup_sweep();
                match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(()) => break,
                    Err(_) => tracing::error!("task cleanup sweeper panicked, restarting"),
                }
            }
        });
    }

    async fn run_cleanup_sweep(&self) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let cutoff = Utc::now()
                        - chrono::Duration::from_std(self.config.completed_ttl).unwrap_or_default();
                    let expired: Vec<String> = self
                        .tasks
                        .iter()
                        .filter(|e| e.status.is_terminal() && e.updated_at < cutoff)
                        .map(|e| e.key().clone())
                        .collect();
                    for task_id in expired {
                        self.evict(&task_id).await;
                    }
                }
            }
        }
    }

    fn spawn_disconnect_listener(&self) {
        let manager = self.clone();
        let mut events = self.registry.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(RegistryEvent::Disconnected(agent_id)) => {
                            manager.fail_tasks_for(&agent_id, "agent offline");
                        }
                        Ok(RegistryEvent::Connected(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "registry event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}

fn snapshot(task_id: &str, rec: &TaskRecord) -> TaskSnapshot {
    TaskSnapshot {
        task_id: task_id.to_string(),
        agent_id: rec.agent_id.clone(),
        status: rec.status,
        created_at: rec.created_at,
        updated_at: rec.updated_at,
        timeout_secs: rec.timeout.as_secs(),
        failure_reason: rec.failure_reason.clone(),
        last_response: rec.last_response.clone(),
    }
}
