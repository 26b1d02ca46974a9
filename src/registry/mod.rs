use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::ws::protocol::ServerMessage;

pub type AgentId = String;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("agent is already connected")]
    AlreadyConnected,
    #[error("agent not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Connected,
    Disconnected,
}

/// The active stream handle for a connected agent. The outbound sender feeds
/// the dispatcher's single writer task; the token tears the stream down.
#[derive(Clone)]
pub struct StreamBinding {
    pub conn_id: String,
    pub outbound: mpsc::Sender<ServerMessage>,
    pub cancel: CancellationToken,
}

struct AgentRecord {
    status: AgentStatus,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    disconnected_at: Option<DateTime<Utc>>,
    metadata: HashMap<String, String>,
    binding: Option<StreamBinding>,
}

/// Read-side copy of an agent record, without the stream handle.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub connected: usize,
    pub disconnected: usize,
}

/// Status-change notifications for listeners (liveness, task manager).
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Connected(AgentId),
    Disconnected(AgentId),
}

/// Tracks every agent the server has seen and enforces the one-stream-per-
/// agent invariant. All mutations are atomic per record; reads return copies.
#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<DashMap<AgentId, AgentRecord>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            agents: Arc::new(DashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Bind a stream to an agent, creating the record on first contact.
    /// Rejects a second concurrent stream for the same agent.
    pub fn register(
        &self,
        agent_id: &str,
        binding: StreamBinding,
    ) -> Result<(), RegistryError> {
        let now = Utc::now();
        {
            let mut entry = self
                .agents
                .entry(agent_id.to_string())
                .or_insert_with(|| AgentRecord {
                    status: AgentStatus::Disconnected,
                    first_seen: now,
                    last_seen: now,
                    disconnected_at: None,
                    metadata: HashMap::new(),
                    binding: None,
                });
            if entry.binding.is_some() {
                return Err(RegistryError::AlreadyConnected);
            }
            entry.status = AgentStatus::Connected;
            entry.last_seen = now;
            entry.disconnected_at = None;
            entry.binding = Some(binding);
        }
        let _ = self.events.send(RegistryEvent::Connected(agent_id.to_string()));
        tracing::info!(agent_id, "agent connected");
        Ok(())
    }

    /// Release the stream held by `conn_id`. A stale dispatcher finishing
    /// after a newer connection registered is a no-op. Idempotent.
    pub fn unregister(&self, agent_id: &str, conn_id: &str) {
        let is_current = self
            .agents
            .get(agent_id)
            .and_then(|r| r.binding.as_ref().map(|b| b.conn_id == conn_id))
            .unwrap_or(false);
        if is_current {
            self.mark_disconnected(agent_id);
        }
    }

    pub fn mark_connected(&self, agent_id: &str) {
        if let Some(mut rec) = self.agents.get_mut(agent_id) {
            rec.status = AgentStatus::Connected;
            rec.last_seen = Utc::now();
        }
    }

    /// Cancel and drop the agent's stream binding and record the disconnect.
    /// Idempotent: a second call on a disconnected agent changes nothing.
    pub fn mark_disconnected(&self, agent_id: &str) {
        let mut notify = false;
        if let Some(mut rec) = self.agents.get_mut(agent_id) {
            if let Some(binding) = rec.binding.take() {
                binding.cancel.cancel();
                rec.status = AgentStatus::Disconnected;
                rec.disconnected_at = Some(Utc::now());
                notify = true;
            }
        }
        if notify {
            let _ = self
                .events
                .send(RegistryEvent::Disconnected(agent_id.to_string()));
            tracing::info!(agent_id, "agent disconnected");
        }
    }

    pub fn update_last_seen(&self, agent_id: &str) {
        if let Some(mut rec) = self.agents.get_mut(agent_id) {
            rec.last_seen = Utc::now();
        }
    }

    pub fn set_metadata(&self, agent_id: &str, metadata: HashMap<String, String>) {
        if let Some(mut rec) = self.agents.get_mut(agent_id) {
            rec.metadata = metadata;
        }
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.agents
            .get(agent_id)
            .map(|r| r.binding.is_some())
            .unwrap_or(false)
    }

    /// Outbound sender for the agent's stream, if connected.
    pub fn outbound_sender(&self, agent_id: &str) -> Option<mpsc::Sender<ServerMessage>> {
        self.agents
            .get(agent_id)
            .and_then(|r| r.binding.as_ref().map(|b| b.outbound.clone()))
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentSnapshot> {
        self.agents.get(agent_id).map(|r| snapshot(agent_id, &r))
    }

    pub fn list(&self, status: Option<AgentStatus>) -> Vec<AgentSnapshot> {
        self.agents
            .iter()
            .filter(|entry| status.map(|s| entry.status == s).unwrap_or(true))
            .map(|entry| snapshot(entry.key(), entry.value()))
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let total = self.agents.len();
        let connected = self
            .agents
            .iter()
            .filter(|e| e.status == AgentStatus::Connected)
            .count();
        RegistryStats {
            total,
            connected,
            disconnected: total - connected,
        }
    }

    /// Remove records that have been continuously disconnected for longer
    /// than `stale_ttl`. Returns how many were evicted.
    pub fn sweep_stale(&self, stale_ttl: std::time::Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(stale_ttl).unwrap_or_default();
        let stale: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|e| {
                e.binding.is_none()
                    && e.disconnected_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|e| e.key().clone())
            .collect();
        for agent_id in &stale {
            self.agents.remove(agent_id);
            tracing::info!(%agent_id, "evicted stale agent record");
        }
        stale.len()
    }

    /// Background sweep removing long-disconnected records.
    pub fn spawn_sweeper(
        &self,
        interval: std::time::Duration,
        stale_ttl: std::time::Duration,
        shutdown: CancellationToken,
    ) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep_stale(stale_ttl);
                    }
                }
            }
        });
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot(agent_id: &str, rec: &AgentRecord) -> AgentSnapshot {
    AgentSnapshot {
        agent_id: agent_id.to_string(),
        status: rec.status,
        first_seen: rec.first_seen,
        last_seen: rec.last_seen,
        disconnected_at: rec.disconnected_at,
        metadata: rec.metadata.clone(),
    }
}
