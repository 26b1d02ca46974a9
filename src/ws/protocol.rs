use serde::{Deserialize, Serialize};

/// Messages sent server -> agent over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ping { ts: i64 },
    Task(TaskRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub agent_id: String,
    pub task_id: String,
    pub payload: TaskPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    ShellExecute {
        cmd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    DockerOperation {
        action: String,
        container_id: String,
    },
    MetricsRequest {
        #[serde(default)]
        watch: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval_secs: Option<u64>,
    },
    TaskCancel {},
    LogMessage {
        level: String,
        message: String,
    },
}

impl TaskPayload {
    /// Streaming payloads keep the task room alive longer after the final
    /// response so stragglers still reach subscribers.
    pub fn is_streaming(&self) -> bool {
        matches!(self, TaskPayload::MetricsRequest { watch: true, .. })
    }
}

/// Messages received agent -> server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Pong { ts: i64, ping_ts: i64 },
    TaskResponse(TaskResponse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Unknown,
    Completed,
    Failure,
    InProgress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub agent_id: String,
    pub task_id: String,
    pub status: ResponseStatus,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ResponsePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponsePayload {
    ShellOutput {
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    CancelAck {},
    Metrics {
        cpu_percent: f64,
        memory_used_bytes: u64,
        memory_total_bytes: u64,
        #[serde(default)]
        uptime_secs: u64,
    },
}

/// Wall-clock milliseconds used for ping/pong timestamps on the wire.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
