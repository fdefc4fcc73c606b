//! Run state: the run row, its step history, and its audit trail.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dsl::StepType;

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Status of a workflow run.
///
/// ```text
/// Pending -> Running <-> Waiting
/// Running -> Completed
/// Running | Waiting -> Failed -> Compensating -> Compensated
/// Pending | Running | Waiting -> Cancelled -> Compensating -> Compensated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
    Compensating,
    Compensated,
}

impl RunStatus {
    pub const ALL: [RunStatus; 8] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Waiting,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Cancelled,
        RunStatus::Compensating,
        RunStatus::Compensated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Waiting => "waiting",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Compensating => "compensating",
            RunStatus::Compensated => "compensated",
        }
    }

    /// Completed and Compensated accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Compensated)
    }

    /// Runs that can still dispatch forward steps or accept signals.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunStatus::Pending | RunStatus::Running | RunStatus::Waiting
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Running)
                | (Running, Waiting)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Waiting, Running)
                | (Waiting, Failed)
                | (Waiting, Cancelled)
                | (Failed, Compensating)
                | (Cancelled, Compensating)
                | (Compensating, Compensated)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("invalid run status: '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// WaitState
// ---------------------------------------------------------------------------

/// What happens when a paused step's deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineAction {
    /// Deliver the awaited signal (timers).
    Signal,
    /// Fail the step with a timeout.
    Fail,
}

/// The paused position of a Waiting run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitState {
    pub step_key: String,
    /// The run-step record left open while waiting.
    pub run_step_id: Uuid,
    /// The signal that resumes the run.
    pub signal: String,
    /// Signals that fail the waiting step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fail_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default = "default_deadline_action")]
    pub on_deadline: DeadlineAction,
}

fn default_deadline_action() -> DeadlineAction {
    DeadlineAction::Fail
}

impl WaitState {
    /// Whether `signal` is one this wait reacts to at all.
    pub fn accepts(&self, signal: &str) -> bool {
        self.signal == signal || self.fail_on.iter().any(|s| s == signal)
    }
}

// ---------------------------------------------------------------------------
// WorkflowRun
// ---------------------------------------------------------------------------

/// One execution instance, pinned to the definition version it started on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub definition_code: String,
    /// Pinned at start; never changes.
    pub version_number: u32,
    pub status: RunStatus,
    /// The mutable data bag steps read and write.
    pub input_context: Value,
    /// Set when the run completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub initiated_by: String,
    /// Parent run when started by a sub-workflow step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
    /// Step the run is positioned on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting: Option<WaitState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Optimistic concurrency stamp, bumped on every write.
    pub row_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// A fresh Pending run.
    pub fn new(
        definition_code: impl Into<String>,
        version_number: u32,
        input_context: Value,
        correlation_id: Option<String>,
        initiated_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            definition_code: definition_code.into(),
            version_number,
            status: RunStatus::Pending,
            input_context,
            output_context: None,
            correlation_id,
            initiated_by: initiated_by.into(),
            parent_run_id: None,
            current_step: None,
            waiting: None,
            last_error: None,
            row_version: 0,
            started_at: None,
            ended_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Filter for listing runs.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub definition_code: Option<String>,
    pub status: Option<RunStatus>,
    pub correlation_id: Option<String>,
    pub limit: Option<u32>,
}

// ---------------------------------------------------------------------------
// WorkflowRunStep
// ---------------------------------------------------------------------------

/// Status of one step execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

/// One record per step execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunStep {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_key: String,
    pub step_type: StepType,
    pub status: StepStatus,
    /// 1-based counter across all executions of this step key in the run.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowRunStep {
    /// A fresh Running record.
    pub fn start(run_id: Uuid, step_key: impl Into<String>, step_type: StepType, attempt: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            step_key: step_key.into(),
            step_type,
            status: StepStatus::Running,
            attempt,
            request_payload: None,
            response_payload: None,
            error: None,
            idempotency_key: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Audit records
// ---------------------------------------------------------------------------

/// What the router did with a delivered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDisposition {
    /// Resumed the run.
    Accepted,
    /// The run was Waiting on a different signal.
    Mismatched,
    /// The run was no longer Waiting.
    Stale,
}

impl SignalDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalDisposition::Accepted => "accepted",
            SignalDisposition::Mismatched => "mismatched",
            SignalDisposition::Stale => "stale",
        }
    }
}

impl FromStr for SignalDisposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(SignalDisposition::Accepted),
            "mismatched" => Ok(SignalDisposition::Mismatched),
            "stale" => Ok(SignalDisposition::Stale),
            other => Err(format!("invalid signal disposition: '{other}'")),
        }
    }
}

/// A signal delivered to a run, kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub name: String,
    pub payload: Value,
    pub disposition: SignalDisposition,
    pub received_at: DateTime<Utc>,
}

/// A move of the run's position from one step to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_step: Option<String>,
    /// Branch condition that selected the edge, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransitionRecord {
    pub fn new(run_id: Uuid, from_step: Option<String>, to_step: Option<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            from_step,
            to_step,
            condition: None,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of one compensation action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    Succeeded,
    Failed,
}

impl CompensationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationStatus::Succeeded => "succeeded",
            CompensationStatus::Failed => "failed",
        }
    }
}

impl FromStr for CompensationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(CompensationStatus::Succeeded),
            "failed" => Ok(CompensationStatus::Failed),
            other => Err(format!("invalid compensation status: '{other}'")),
        }
    }
}

/// One compensation action executed for one completed step.
///
/// At most one record exists per (run step, action index), which is what
/// makes a resumed compensation skip actions that already ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub run_step_id: Uuid,
    pub step_key: String,
    pub action_index: u32,
    pub kind: String,
    pub status: CompensationStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Everything recorded about a run, for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistory {
    pub run: WorkflowRun,
    pub steps: Vec<WorkflowRunStep>,
    pub signals: Vec<SignalRecord>,
    pub transitions: Vec<TransitionRecord>,
    pub compensations: Vec<CompensationRecord>,
}
