//! Human-task creation and query port.

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A task to create in the inbox for a paused run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanTaskRequest {
    pub run_id: Uuid,
    pub step_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub payload: Value,
    /// Execution key of the creating attempt.
    pub idempotency_key: String,
}

/// Current state of a created task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HumanTaskState {
    Open,
    Completed { outcome: Value },
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("task inbox unavailable: {0}")]
    Unavailable(String),

    #[error("task rejected: {0}")]
    Rejected(String),

    #[error("task '{0}' not found")]
    NotFound(String),
}

/// Creates tasks for people and reports on them.
pub trait HumanTaskGateway: Send + Sync {
    /// Create a task and return its id.
    fn create_task(
        &self,
        request: &HumanTaskRequest,
    ) -> impl Future<Output = Result<String, GatewayError>> + Send;

    fn task_state(
        &self,
        task_id: &str,
    ) -> impl Future<Output = Result<HumanTaskState, GatewayError>> + Send;
}
