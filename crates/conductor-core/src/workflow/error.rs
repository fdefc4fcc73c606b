//! Errors returned to callers of the engine's external operations.

use uuid::Uuid;

use conductor_types::error::{DefinitionError, RepositoryError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Unknown definition code or version. No run was created.
    #[error("workflow definition '{code}' not found{}", version_suffix(.version))]
    DefinitionNotFound { code: String, version: Option<u32> },

    /// The version exists but may not start runs.
    #[error("version {version} of '{code}' is {status}, not published")]
    NotPublished {
        code: String,
        version: u32,
        status: String,
    },

    #[error("workflow run {0} not found")]
    RunNotFound(Uuid),

    /// The run's state does not allow the requested operation.
    #[error("run {run_id}: {reason}")]
    InvalidTransition { run_id: Uuid, reason: String },

    /// The run failed after partial execution; see its last error and step history.
    #[error("run {run_id} failed at step '{step_key}': {reason}")]
    StepExecutionFailed {
        run_id: Uuid,
        step_key: String,
        reason: String,
    },

    /// Optimistic-concurrency retries exhausted.
    #[error("run {run_id} was modified concurrently; retry the operation")]
    ConcurrencyConflict { run_id: Uuid },

    /// A duplicate request is still being executed by another caller.
    #[error("request with idempotency key '{key}' is still in flight")]
    IdempotencyInFlight { key: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("storage error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn version_suffix(version: &Option<u32>) -> String {
    version.map(|v| format!(" (version {v})")).unwrap_or_default()
}

impl EngineError {
    /// Whether the operation was rejected before any run state changed.
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            EngineError::StepExecutionFailed { .. }
                | EngineError::ConcurrencyConflict { .. }
                | EngineError::Repository(_)
                | EngineError::Serialization(_)
        )
    }

    /// Transient failures the caller may retry as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::ConcurrencyConflict { .. }
                | EngineError::IdempotencyInFlight { .. }
                | EngineError::Repository(RepositoryError::Connection)
        )
    }
}
