//! Step handler contract, outcome type, and the explicit handler registry.
//!
//! Every `StepType` maps to exactly one handler, registered at startup.
//! Handlers never see the store: they get a read-only `StepContext` and
//! answer with a `StepOutcome` that the interpreter persists.
//!
//! `StepHandler` uses RPITIT and cannot be a trait object directly. Follows
//! the boxed-future pattern:
//! 1. `StepHandlerDyn` is an object-safe mirror with boxed futures
//! 2. Blanket-impl `StepHandlerDyn` for all `T: StepHandler`
//! 3. `BoxStepHandler` wraps `Box<dyn StepHandlerDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use conductor_types::dsl::{StepSpec, StepType};
use conductor_types::run::{DeadlineAction, WorkflowRun};

use super::context::RunContext;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Why a step attempt failed, and whether trying again can help.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFailure {
    Retryable(String),
    Fatal(String),
}

impl StepFailure {
    pub fn reason(&self) -> &str {
        match self {
            StepFailure::Retryable(r) | StepFailure::Fatal(r) => r,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StepFailure::Retryable(_))
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepFailure::Retryable(r) => write!(f, "retryable: {r}"),
            StepFailure::Fatal(r) => write!(f, "fatal: {r}"),
        }
    }
}

/// Where a completed step sends the run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Route {
    /// The step's declared `next`.
    #[default]
    Next,
    /// A specific step chosen at runtime (branching).
    Goto {
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },
    /// Run these steps concurrently, then continue at the declared `next`.
    FanOut { branches: Vec<String> },
}

/// How a step pauses the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitRequest {
    pub signal: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fail_on: Vec<String>,
    /// Deadline measured from the moment the run starts waiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub on_deadline: DeadlineAction,
    /// Recorded as the step's request payload (e.g. a created task id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
}

impl WaitRequest {
    pub fn for_signal(signal: impl Into<String>) -> Self {
        Self {
            signal: signal.into(),
            fail_on: Vec::new(),
            timeout_secs: None,
            on_deadline: DeadlineAction::Fail,
            request: None,
        }
    }
}

/// Result of one step attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Merge `output` into the context and follow `route`.
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default)]
        route: Route,
    },
    /// Persist the run as Waiting; a signal resumes it.
    Waiting(WaitRequest),
    Failed(StepFailure),
}

impl StepOutcome {
    pub fn completed(output: Value) -> Self {
        StepOutcome::Completed {
            output: Some(output),
            route: Route::Next,
        }
    }

    pub fn done() -> Self {
        StepOutcome::Completed {
            output: None,
            route: Route::Next,
        }
    }

    pub fn retryable(reason: impl Into<String>) -> Self {
        StepOutcome::Failed(StepFailure::Retryable(reason.into()))
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        StepOutcome::Failed(StepFailure::Fatal(reason.into()))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

// ---------------------------------------------------------------------------
// Child runs
// ---------------------------------------------------------------------------

/// A child run requested by a sub-workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRunRequest {
    pub definition_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    pub input: Value,
    pub parent_run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub initiated_by: String,
}

/// Creates child runs on behalf of a step. Provided by the interpreter per attempt.
pub trait ChildRunLauncher: Send + Sync {
    fn launch<'a>(
        &'a self,
        request: ChildRunRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Uuid, StepFailure>> + Send + 'a>>;
}

/// Launcher for contexts where child runs are not allowed (parallel branches, dry runs).
pub struct NoChildRuns;

impl ChildRunLauncher for NoChildRuns {
    fn launch<'a>(
        &'a self,
        request: ChildRunRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Uuid, StepFailure>> + Send + 'a>> {
        Box::pin(async move {
            Err(StepFailure::Fatal(format!(
                "child run of '{}' cannot be started here",
                request.definition_code
            )))
        })
    }
}

// ---------------------------------------------------------------------------
// Handler contract
// ---------------------------------------------------------------------------

/// Read-only view handed to a handler for one attempt.
pub struct StepContext<'a> {
    pub run: &'a WorkflowRun,
    pub step: &'a StepSpec,
    /// 1-based attempt counter for this step key within the run.
    pub attempt: u32,
    /// `{run_id}:{step_key}:{attempt}`; stable across crash replays of the attempt.
    pub execution_key: &'a str,
    pub context: &'a RunContext,
    pub children: &'a dyn ChildRunLauncher,
}

/// Executes one step type.
pub trait StepHandler: Send + Sync {
    fn step_type(&self) -> StepType;

    fn execute(&self, ctx: &StepContext<'_>) -> impl Future<Output = StepOutcome> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn step_type(&self) -> StepType;

    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a StepContext<'a>,
    ) -> Pin<Box<dyn Future<Output = StepOutcome> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn step_type(&self) -> StepType {
        StepHandler::step_type(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a StepContext<'a>,
    ) -> Pin<Box<dyn Future<Output = StepOutcome> + Send + 'a>> {
        Box::pin(self.execute(ctx))
    }
}

/// Type-erased step handler.
pub struct BoxStepHandler {
    inner: Box<dyn StepHandlerDyn>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub fn step_type(&self) -> StepType {
        self.inner.step_type()
    }

    pub async fn execute<'a>(&'a self, ctx: &'a StepContext<'a>) -> StepOutcome {
        self.inner.execute_boxed(ctx).await
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Fixed mapping from step type to handler, built once at startup.
#[derive(Default)]
pub struct StepHandlerRegistry {
    handlers: HashMap<StepType, BoxStepHandler>,
}

impl StepHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own step type. Returns the one it replaced.
    pub fn register<T: StepHandler + 'static>(&mut self, handler: T) -> Option<BoxStepHandler> {
        let step_type = StepHandler::step_type(&handler);
        self.handlers.insert(step_type, BoxStepHandler::new(handler))
    }

    pub fn with<T: StepHandler + 'static>(mut self, handler: T) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, step_type: StepType) -> Option<&BoxStepHandler> {
        self.handlers.get(&step_type)
    }

    /// Step types with no handler.
    pub fn missing(&self) -> Vec<StepType> {
        StepType::ALL
            .into_iter()
            .filter(|t| !self.handlers.contains_key(t))
            .collect()
    }
}

impl std::fmt::Debug for StepHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("StepHandlerRegistry")
            .field("handlers", &types)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    impl StepHandler for EchoHandler {
        fn step_type(&self) -> StepType {
            StepType::Assign
        }

        async fn execute(&self, ctx: &StepContext<'_>) -> StepOutcome {
            StepOutcome::completed(json!({ "echo": ctx.step.id }))
        }
    }

    #[test]
    fn test_outcome_serde_roundtrip() {
        let outcomes = vec![
            StepOutcome::completed(json!({ "a": 1 })),
            StepOutcome::Completed {
                output: None,
                route: Route::Goto {
                    target: "b".to_string(),
                    condition: Some("x > 1".to_string()),
                },
            },
            StepOutcome::Waiting(WaitRequest::for_signal("PaymentConfirmed")),
            StepOutcome::retryable("503"),
        ];
        for outcome in outcomes {
            let value = serde_json::to_value(&outcome).unwrap();
            let parsed: StepOutcome = serde_json::from_value(value).unwrap();
            assert_eq!(parsed, outcome);
        }
    }

    #[test]
    fn test_failure_accessors() {
        let failure = StepFailure::Retryable("timeout".to_string());
        assert!(failure.is_retryable());
        assert_eq!(failure.reason(), "timeout");
        assert_eq!(failure.to_string(), "retryable: timeout");
        assert!(!StepFailure::Fatal("x".to_string()).is_retryable());
    }

    #[test]
    fn test_registry_reports_missing_types() {
        let registry = StepHandlerRegistry::new().with(EchoHandler);
        assert!(registry.get(StepType::Assign).is_some());
        assert!(registry.get(StepType::Timer).is_none());
        let missing = registry.missing();
        assert_eq!(missing.len(), StepType::ALL.len() - 1);
        assert!(!missing.contains(&StepType::Assign));
    }

    #[test]
    fn test_register_replaces_existing() {
        let mut registry = StepHandlerRegistry::new();
        assert!(registry.register(EchoHandler).is_none());
        assert!(registry.register(EchoHandler).is_some());
    }

    #[tokio::test]
    async fn test_boxed_handler_dispatch() {
        let registry = StepHandlerRegistry::new().with(EchoHandler);
        let run = WorkflowRun::new("Test", 1, json!({}), None, "tester");
        let step = StepSpec::new(
            "say",
            conductor_types::dsl::StepConfig::Assign {
                values: serde_json::Map::new(),
            },
        );
        let context = RunContext::default();
        let ctx = StepContext {
            run: &run,
            step: &step,
            attempt: 1,
            execution_key: "k",
            context: &context,
            children: &NoChildRuns,
        };
        let handler = registry.get(StepType::Assign).unwrap();
        let outcome = handler.execute(&ctx).await;
        assert_eq!(outcome, StepOutcome::completed(json!({ "echo": "say" })));
    }

    #[tokio::test]
    async fn test_no_child_runs_rejects() {
        let result = NoChildRuns
            .launch(ChildRunRequest {
                definition_code: "Shipping".to_string(),
                version: None,
                input: json!({}),
                parent_run_id: Uuid::now_v7(),
                correlation_id: None,
                initiated_by: "t".to_string(),
            })
            .await;
        assert!(matches!(result, Err(StepFailure::Fatal(_))));
    }
}
