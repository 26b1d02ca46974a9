use std::collections::HashMap;
use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub cors_origin: String,
    /// Deadline applied to plain HTTP handlers (not to established streams).
    pub http_timeout: Duration,
    /// Agent credentials: `AGENT_TOKENS="agent-1=tok1,agent-2=tok2"`.
    pub agent_tokens: HashMap<String, String>,
    pub ping_interval: Duration,
    pub offline_timeout: Duration,
    pub default_task_timeout: Duration,
    pub max_task_timeout: Duration,
    /// How long terminal tasks are kept before the sweep evicts them.
    pub completed_task_ttl: Duration,
    pub task_cleanup_interval: Duration,
    /// Grace period after a final response during which late events still flow.
    pub cleanup_grace: Duration,
    pub streaming_cleanup_grace: Duration,
    pub registry_stale_ttl: Duration,
    pub registry_cleanup_interval: Duration,
    /// Per-subscriber SSE delivery queue depth.
    pub subscriber_buffer: usize,
    /// Replay window retained per buffered room.
    pub room_buffer: usize,
    /// Hub intake queue depth; 0 means derive as 1000x subscriber_buffer.
    pub hub_intake_capacity: usize,
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_u64(key, default))
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8070),
            cors_origin: env::var("CORS_ORIGIN").unwrap_or_else(|_| "*".into()),
            http_timeout: env_secs("HTTP_TIMEOUT_SECS", 30),
            agent_tokens: env::var("AGENT_TOKENS")
                .map(|v| Self::parse_agent_tokens(&v))
                .unwrap_or_default(),
            ping_interval: env_secs("PING_INTERVAL_SECS", 3),
            offline_timeout: env_secs("OFFLINE_TIMEOUT_SECS", 6),
            default_task_timeout: env_secs("TASK_DEFAULT_TIMEOUT_SECS", 300),
            max_task_timeout: env_secs("TASK_MAX_TIMEOUT_SECS", 3600),
            completed_task_ttl: env_secs("TASK_COMPLETED_TTL_SECS", 1800),
            task_cleanup_interval: env_secs("TASK_CLEANUP_INTERVAL_SECS", 300),
            cleanup_grace: env_secs("TASK_CLEANUP_GRACE_SECS", 5),
            streaming_cleanup_grace: env_secs("TASK_STREAMING_CLEANUP_GRACE_SECS", 30),
            registry_stale_ttl: env_secs("REGISTRY_STALE_TTL_SECS", 86400),
            registry_cleanup_interval: env_secs("REGISTRY_CLEANUP_INTERVAL_SECS", 3600),
            subscriber_buffer: env_u64("SUBSCRIBER_BUFFER", 16) as usize,
            room_buffer: env_u64("ROOM_BUFFER", 10) as usize,
            hub_intake_capacity: env_u64("HUB_INTAKE_CAPACITY", 0) as usize,
        }
    }

    /// Parse `id=token` pairs, comma-separated. Malformed pairs are skipped.
    pub fn parse_agent_tokens(raw: &str) -> HashMap<String, String> {
        raw.split(',')
            .filter_map(|pair| {
                let (id, token) = pair.split_once('=')?;
                let (id, token) = (id.trim(), token.trim());
                if id.is_empty() || token.is_empty() {
                    return None;
                }
                Some((id.to_string(), token.to_string()))
            })
            .collect()
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_origin
            .split(',')
            .map(|s| s.trim().to_string())
            .collect()
    }

    pub fn intake_capacity(&self) -> usize {
        if self.hub_intake_capacity > 0 {
            self.hub_intake_capacity
        } else {
            1000 * self.subscriber_buffer.max(1)
        }
    }
}
