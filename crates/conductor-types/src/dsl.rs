//! Declarative step-graph DSL stored per definition version.
//!
//! A `WorkflowDsl` is authored as YAML or JSON and persisted as JSON in the
//! version row. Each `StepSpec` names a fixed `StepType`, carries a config
//! payload tagged by that type, an optional successor, an optional retry
//! policy, and the compensation actions that undo it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// DSL format version understood by this build.
pub const SUPPORTED_SCHEMA_VERSION: u32 = 1;

/// Signal delivered to a run paused on a timer once its deadline passes.
pub const TIMER_ELAPSED_SIGNAL: &str = "TimerElapsed";

/// Default signal a human task waits for.
pub const HUMAN_TASK_COMPLETED_SIGNAL: &str = "HumanTaskCompleted";

/// Signals a parent run receives when a waited-on child run finishes.
pub const SUB_WORKFLOW_COMPLETED_SIGNAL: &str = "SubWorkflowCompleted";
pub const SUB_WORKFLOW_FAILED_SIGNAL: &str = "SubWorkflowFailed";

// ---------------------------------------------------------------------------
// WorkflowDsl
// ---------------------------------------------------------------------------

/// The step graph of one definition version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDsl {
    /// Format version of this document.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Id of the first step.
    pub start_at: String,
    /// Step specs in declaration order.
    pub steps: Vec<StepSpec>,
    /// Context keys copied into the run's output context on completion.
    /// Empty means the whole context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_keys: Vec<String>,
}

fn default_schema_version() -> u32 {
    SUPPORTED_SCHEMA_VERSION
}

impl WorkflowDsl {
    /// Look up a step spec by id.
    pub fn step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// StepSpec
// ---------------------------------------------------------------------------

/// One node in the step graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Graph node id, unique within the DSL.
    pub id: String,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The kind of step.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Step-specific configuration payload.
    pub config: StepConfig,
    /// Declared successor. `None` ends the run after this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Attempt budget for retryable failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Wall-clock timeout measured from the attempt's start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Rollback actions, executed in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensation: Vec<CompensationAction>,
}

impl StepSpec {
    /// Build a spec whose `step_type` matches its config.
    pub fn new(id: impl Into<String>, config: StepConfig) -> Self {
        Self {
            id: id.into(),
            name: None,
            step_type: config.step_type(),
            config,
            next: None,
            retry: None,
            timeout_secs: None,
            compensation: Vec::new(),
        }
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_compensation(mut self, action: CompensationAction) -> Self {
        self.compensation.push(action);
        self
    }
}

// ---------------------------------------------------------------------------
// StepType
// ---------------------------------------------------------------------------

/// The fixed set of step kinds. Each maps to exactly one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    ServiceTask,
    HumanTask,
    WaitForSignal,
    Timer,
    SubWorkflow,
    Branch,
    Parallel,
    EmitEvent,
    Assign,
}

impl StepType {
    pub const ALL: [StepType; 9] = [
        StepType::ServiceTask,
        StepType::HumanTask,
        StepType::WaitForSignal,
        StepType::Timer,
        StepType::SubWorkflow,
        StepType::Branch,
        StepType::Parallel,
        StepType::EmitEvent,
        StepType::Assign,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::ServiceTask => "service_task",
            StepType::HumanTask => "human_task",
            StepType::WaitForSignal => "wait_for_signal",
            StepType::Timer => "timer",
            StepType::SubWorkflow => "sub_workflow",
            StepType::Branch => "branch",
            StepType::Parallel => "parallel",
            StepType::EmitEvent => "emit_event",
            StepType::Assign => "assign",
        }
    }

    /// Steps whose effects are visible outside the engine. These run behind
    /// the idempotency guard.
    pub fn is_side_effecting(&self) -> bool {
        matches!(
            self,
            StepType::ServiceTask | StepType::HumanTask | StepType::SubWorkflow | StepType::EmitEvent
        )
    }

    /// Steps that always finish without waiting. Only these may be parallel branches.
    pub fn is_synchronous(&self) -> bool {
        matches!(
            self,
            StepType::ServiceTask | StepType::EmitEvent | StepType::Assign
        )
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown step type: '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// StepConfig
// ---------------------------------------------------------------------------

/// Step-specific configuration payload, internally tagged by `type`.
///
/// ```yaml
/// config:
///   type: service_task
///   method_id: inventory.reserve
///   params:
///     order_id: "{{ orderId }}"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Call another service through the external-call proxy.
    ServiceTask {
        method_id: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        params: Value,
        /// Context key receiving the response payload (defaults to the step id).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assign_to: Option<String>,
    },
    /// Create a task for a person and wait for its completion signal.
    HumanTask {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completion_signal: Option<String>,
        /// Signal that fails the step (e.g. a rejected approval).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rejection_signal: Option<String>,
    },
    /// Pause until a named signal arrives.
    WaitForSignal {
        signal: String,
        /// Signals that fail the step instead of completing it.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        fail_on: Vec<String>,
    },
    /// Pause for a fixed duration.
    Timer { duration_secs: u64 },
    /// Start a child run of another definition.
    SubWorkflow {
        definition_code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u32>,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        input: Value,
        /// Wait for the child to finish before advancing.
        #[serde(default = "default_true")]
        wait: bool,
    },
    /// Ordered conditional routing. First matching rule wins.
    Branch {
        branches: Vec<BranchRule>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    /// Fan out to several synchronous steps, join at `next`.
    Parallel { branches: Vec<String> },
    /// Publish an outbound integration event.
    EmitEvent {
        event_name: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
    },
    /// Write values into the run context.
    Assign { values: Map<String, Value> },
}

fn default_true() -> bool {
    true
}

impl StepConfig {
    pub fn step_type(&self) -> StepType {
        match self {
            StepConfig::ServiceTask { .. } => StepType::ServiceTask,
            StepConfig::HumanTask { .. } => StepType::HumanTask,
            StepConfig::WaitForSignal { .. } => StepType::WaitForSignal,
            StepConfig::Timer { .. } => StepType::Timer,
            StepConfig::SubWorkflow { .. } => StepType::SubWorkflow,
            StepConfig::Branch { .. } => StepType::Branch,
            StepConfig::Parallel { .. } => StepType::Parallel,
            StepConfig::EmitEvent { .. } => StepType::EmitEvent,
            StepConfig::Assign { .. } => StepType::Assign,
        }
    }
}

/// One `when` -> `to` rule of a branch step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRule {
    /// JEXL expression evaluated against the run context.
    pub when: String,
    /// Target step id.
    pub to: String,
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Attempt budget and backoff for retryable step failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(default)]
    pub backoff_ms: u64,
    /// Multiplier applied to the delay for each further attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: 0,
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

// ---------------------------------------------------------------------------
// Compensation
// ---------------------------------------------------------------------------

/// A rollback action declared on a step, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompensationAction {
    /// Reverse a prior service call by invoking another method.
    ServiceCall {
        method_id: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        params: Value,
    },
    /// Reverse a wallet debit.
    WalletReverse {
        #[serde(default, skip_serializing_if = "Value::is_null")]
        config: Value,
    },
    /// Refund a captured payment.
    PaymentRefund {
        #[serde(default, skip_serializing_if = "Value::is_null")]
        config: Value,
    },
    /// Emit a notification event.
    CustomEvent {
        event_name: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        config: Value,
    },
}

/// Dispatch key for compensation action handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationKind {
    ServiceCall,
    WalletReverse,
    PaymentRefund,
    CustomEvent,
}

impl CompensationAction {
    pub fn kind(&self) -> CompensationKind {
        match self {
            CompensationAction::ServiceCall { .. } => CompensationKind::ServiceCall,
            CompensationAction::WalletReverse { .. } => CompensationKind::WalletReverse,
            CompensationAction::PaymentRefund { .. } => CompensationKind::PaymentRefund,
            CompensationAction::CustomEvent { .. } => CompensationKind::CustomEvent,
        }
    }
}

impl CompensationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationKind::ServiceCall => "service_call",
            CompensationKind::WalletReverse => "wallet_reverse",
            CompensationKind::PaymentRefund => "payment_refund",
            CompensationKind::CustomEvent => "custom_event",
        }
    }
}

impl fmt::Display for CompensationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ORDER_YAML: &str = r#"
start_at: reserve-inventory
steps:
  - id: reserve-inventory
    type: service_task
    config:
      type: service_task
      method_id: inventory.reserve
      params:
        order_id: "{{ orderId }}"
    next: await-payment
    retry:
      max_attempts: 2
    compensation:
      - kind: service_call
        method_id: release-inventory
  - id: await-payment
    type: wait_for_signal
    config:
      type: wait_for_signal
      signal: PaymentConfirmed
      fail_on: [PaymentFailed]
    timeout_secs: 3600
output_keys: [orderId, PaymentConfirmed]
"#;

    #[test]
    fn test_dsl_parses_from_yaml() {
        let dsl: WorkflowDsl = serde_yaml_ng::from_str(ORDER_YAML).unwrap();
        assert_eq!(dsl.schema_version, SUPPORTED_SCHEMA_VERSION);
        assert_eq!(dsl.start_at, "reserve-inventory");
        assert_eq!(dsl.steps.len(), 2);

        let reserve = dsl.step("reserve-inventory").unwrap();
        assert_eq!(reserve.step_type, StepType::ServiceTask);
        assert_eq!(reserve.next.as_deref(), Some("await-payment"));
        let retry = reserve.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 2);
        assert_eq!(retry.backoff_multiplier, 2.0);
        assert_eq!(
            reserve.compensation[0],
            CompensationAction::ServiceCall {
                method_id: "release-inventory".to_string(),
                params: Value::Null,
            }
        );

        let wait = dsl.step("await-payment").unwrap();
        match &wait.config {
            StepConfig::WaitForSignal { signal, fail_on } => {
                assert_eq!(signal, "PaymentConfirmed");
                assert_eq!(fail_on, &vec!["PaymentFailed".to_string()]);
            }
            other => panic!("expected wait_for_signal, got {other:?}"),
        }
        assert!(wait.next.is_none());
        assert_eq!(dsl.output_keys.len(), 2);
    }

    #[test]
    fn test_dsl_json_roundtrip_preserves_graph() {
        let dsl: WorkflowDsl = serde_yaml_ng::from_str(ORDER_YAML).unwrap();
        let json = serde_json::to_string(&dsl).unwrap();
        let parsed: WorkflowDsl = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, dsl);
    }

    #[test]
    fn test_step_config_tags() {
        let config = StepConfig::Timer { duration_secs: 30 };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json, json!({"type": "timer", "duration_secs": 30}));

        let sub: StepConfig = serde_json::from_value(json!({
            "type": "sub_workflow",
            "definition_code": "Shipping"
        }))
        .unwrap();
        match sub {
            StepConfig::SubWorkflow { wait, version, .. } => {
                assert!(wait, "wait defaults to true");
                assert!(version.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_branch_config_without_default_still_parses() {
        let config: StepConfig = serde_json::from_value(json!({
            "type": "branch",
            "branches": [{"when": "amount > 100", "to": "review"}]
        }))
        .unwrap();
        match config {
            StepConfig::Branch { branches, default } => {
                assert_eq!(branches.len(), 1);
                assert!(default.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_step_spec_new_derives_type() {
        let spec = StepSpec::new(
            "emit",
            StepConfig::EmitEvent {
                event_name: "OrderShipped".to_string(),
                payload: Value::Null,
            },
        )
        .with_next("done");
        assert_eq!(spec.step_type, StepType::EmitEvent);
        assert_eq!(spec.next.as_deref(), Some("done"));
    }

    #[test]
    fn test_step_type_str_roundtrip() {
        for t in StepType::ALL {
            assert_eq!(t.as_str().parse::<StepType>().unwrap(), t);
        }
        assert!("script".parse::<StepType>().is_err());
    }

    #[test]
    fn test_step_type_classification() {
        assert!(StepType::ServiceTask.is_side_effecting());
        assert!(StepType::EmitEvent.is_side_effecting());
        assert!(!StepType::Branch.is_side_effecting());
        assert!(StepType::Assign.is_synchronous());
        assert!(!StepType::WaitForSignal.is_synchronous());
        assert!(!StepType::HumanTask.is_synchronous());
    }

    #[test]
    fn test_compensation_action_kinds() {
        let action: CompensationAction = serde_json::from_value(json!({
            "kind": "custom_event",
            "event_name": "OrderVoided"
        }))
        .unwrap();
        assert_eq!(action.kind(), CompensationKind::CustomEvent);
        assert_eq!(action.kind().to_string(), "custom_event");

        let refund: CompensationAction =
            serde_json::from_value(json!({"kind": "payment_refund"})).unwrap();
        assert_eq!(refund.kind(), CompensationKind::PaymentRefund);
    }
}
