use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::{AgentId, AgentRegistry};
use crate::ws::protocol::{now_millis, ServerMessage};

#[derive(Clone, Debug)]
pub struct LivenessConfig {
    pub ping_interval: Duration,
    pub offline_timeout: Duration,
}

struct WatchEntry {
    conn_id: String,
    last_pong_at: Instant,
    offline_timer: JoinHandle<()>,
}

/// Sends periodic pings to every connected agent and declares an agent
/// offline when no pong arrives within the offline timeout. The one-shot
/// offline timer is re-armed on each pong by aborting and respawning it.
#[derive(Clone)]
pub struct LivenessMonitor {
    registry: AgentRegistry,
    entries: Arc<DashMap<AgentId, WatchEntry>>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    pub fn new(registry: AgentRegistry, config: LivenessConfig) -> Self {
        Self {
            registry,
            entries: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Start watching a freshly connected agent: arm its offline timer and
    /// run the ping loop until the stream is torn down.
    pub fn watch(
        &self,
        agent_id: &str,
        conn_id: &str,
        outbound: mpsc::Sender<ServerMessage>,
        cancel: CancellationToken,
    ) {
        let entry = WatchEntry {
            conn_id: conn_id.to_string(),
            last_pong_at: Instant::now(),
            offline_timer: self.arm_offline_timer(agent_id, conn_id),
        };
        if let Some(old) = self.entries.insert(agent_id.to_string(), entry) {
            old.offline_timer.abort();
        }

        let monitor = self.clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.ping_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let ping = ServerMessage::Ping { ts: now_millis() };
                        if outbound.send(ping).await.is_err() {
                            // Writer gone: the stream is unreachable.
                            tracing::warn!(%agent_id, "ping send failed, disconnecting");
                            monitor.registry.mark_disconnected(&agent_id);
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Stop watching. A stale connection that was already superseded leaves
    /// the current watch untouched.
    pub fn unwatch(&self, agent_id: &str, conn_id: &str) {
        let matches = self
            .entries
            .get(agent_id)
            .map(|e| e.conn_id == conn_id)
            .unwrap_or(false);
        if matches {
            if let Some((_, entry)) = self.entries.remove(agent_id) {
                entry.offline_timer.abort();
            }
        }
    }

    /// Process a pong: record the roundtrip, refresh last-seen, re-arm the
    /// offline timer.
    pub fn handle_pong(&self, agent_id: &str, ping_ts: i64) {
        let roundtrip_ms = now_millis() - ping_ts;
        tracing::trace!(agent_id, roundtrip_ms, "pong");
        self.registry.update_last_seen(agent_id);

        if let Some(mut entry) = self.entries.get_mut(agent_id) {
            entry.last_pong_at = Instant::now();
            entry.offline_timer.abort();
            let conn_id = entry.conn_id.clone();
            entry.offline_timer = self.arm_offline_timer(agent_id, &conn_id);
        }
    }

    pub fn watched_count(&self) -> usize {
        self.entries.len()
    }

    fn arm_offline_timer(&self, agent_id: &str, conn_id: &str) -> JoinHandle<()> {
        let monitor = self.clone();
        let agent_id = agent_id.to_string();
        let conn_id = conn_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(monitor.config.offline_timeout).await;
            monitor.declare_offline(&agent_id, &conn_id);
        })
    }

    fn declare_offline(&self, agent_id: &str, conn_id: &str) {
        let silence = match self.entries.remove_if(agent_id, |_, e| e.conn_id == conn_id) {
            Some((_, entry)) => entry.last_pong_at.elapsed(),
            None => return,
        };
        tracing::warn!(
            agent_id,
            silent_for_ms = silence.as_millis() as u64,
            "pong deadline elapsed, evicting agent"
        );
        // Cancels the stream binding and notifies listeners; the task
        // manager fails this agent's in-flight tasks off the event.
        self.registry.mark_disconnected(agent_id);
    }
}
