mod manager;

pub use manager::{TaskManager, TaskManagerConfig};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::ws::protocol::{ResponseStatus, TaskPayload, TaskResponse};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("agent is not connected")]
    AgentNotConnected,
    #[error("task not found")]
    NotFound,
    #[error("task already reached a terminal state")]
    AlreadyTerminal,
    #[error("invalid task payload: {0}")]
    InvalidPayload(String),
    #[error("stream transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Sent,
    InProgress,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }
}

pub(crate) struct TaskRecord {
    pub agent_id: String,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub timeout: std::time::Duration,
    pub cancel: CancellationToken,
    pub last_response: Option<TaskResponse>,
    pub failure_reason: Option<String>,
}

/// Immutable copy of a task record handed to HTTP callers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub agent_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_response: Option<TaskResponse>,
}

/// Status transition driven by an ingested response. `None` leaves the
/// current (non-terminal) status in place.
///
/// A `FAILURE` carrying `cancelled=true` maps to cancelled even without
/// `is_final`, matching how agents report aborted work.
pub(crate) fn next_status(response: &TaskResponse) -> Option<TaskStatus> {
    match response.status {
        ResponseStatus::InProgress => Some(TaskStatus::InProgress),
        ResponseStatus::Completed if !response.is_final => Some(TaskStatus::InProgress),
        ResponseStatus::Completed if response.cancelled => Some(TaskStatus::Cancelled),
        ResponseStatus::Completed => Some(TaskStatus::Completed),
        ResponseStatus::Failure if response.cancelled => Some(TaskStatus::Cancelled),
        ResponseStatus::Failure => Some(TaskStatus::Failed),
        ResponseStatus::Unknown => None,
    }
}
