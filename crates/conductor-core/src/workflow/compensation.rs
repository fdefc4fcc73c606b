//! Saga-style compensation of failed and cancelled runs.
//!
//! Once a run is Compensating, the `Compensator` walks its Completed step
//! records newest-first (by `ended_at`) and invokes each declared
//! compensation action in declaration order. Every action runs behind an
//! idempotency slot keyed by `{run}:{run_step}:comp:{index}` and leaves one
//! `CompensationRecord`, so a compensation resumed after a crash skips the
//! actions that already ran. Action failures are logged and recorded; they
//! never stop the walk or the final transition to Compensated.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use conductor_types::config::CompensationConfig;
use conductor_types::dsl::{CompensationAction, CompensationKind};
use conductor_types::event::IntegrationEvent;
use conductor_types::idempotency::IdempotencyCheck;
use conductor_types::run::{
    CompensationRecord, CompensationStatus, RunStatus, StepStatus, WorkflowRun, WorkflowRunStep,
};

use crate::gateway::{EventPublisher, ExternalCallProxy, ServiceCall};
use crate::repository::WorkflowStore;

use super::context::RunContext;
use super::error::EngineError;
use super::idempotency::SlotKey;
use super::interpreter::{Commit, Interpreter};

/// Idempotency route of compensation actions.
pub const COMPENSATION_ROUTE: &str = "workflow.compensation";

/// `{run_id}:{run_step_id}:comp:{index}`, also forwarded to callees.
pub fn action_key(run_id: Uuid, run_step_id: Uuid, index: u32) -> String {
    format!("{run_id}:{run_step_id}:comp:{index}")
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{0}")]
    Failed(String),

    #[error("no handler registered for {0} actions")]
    NoHandler(CompensationKind),

    #[error("{kind} handler received a {actual} action")]
    Mismatch {
        kind: CompensationKind,
        actual: CompensationKind,
    },
}

// ---------------------------------------------------------------------------
// Action handler contract
// ---------------------------------------------------------------------------

/// One compensation action to perform for one completed step record.
pub struct ActionTarget<'a> {
    pub run: &'a WorkflowRun,
    pub step: &'a WorkflowRunStep,
    pub action: &'a CompensationAction,
    pub action_key: &'a str,
    /// The run context at the time compensation started.
    pub context: &'a RunContext,
}

/// Executes one compensation action kind.
pub trait ActionHandler: Send + Sync {
    fn kind(&self) -> CompensationKind;

    fn execute(&self, target: &ActionTarget<'_>) -> impl Future<Output = Result<(), ActionError>> + Send;
}

/// Object-safe version of [`ActionHandler`].
pub trait ActionHandlerDyn: Send + Sync {
    fn kind(&self) -> CompensationKind;

    fn execute_boxed<'a>(
        &'a self,
        target: &'a ActionTarget<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send + 'a>>;
}

impl<T: ActionHandler> ActionHandlerDyn for T {
    fn kind(&self) -> CompensationKind {
        ActionHandler::kind(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        target: &'a ActionTarget<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send + 'a>> {
        Box::pin(self.execute(target))
    }
}

/// Type-erased action handler.
pub struct BoxActionHandler {
    inner: Box<dyn ActionHandlerDyn>,
}

impl BoxActionHandler {
    pub fn new<T: ActionHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub fn kind(&self) -> CompensationKind {
        self.inner.kind()
    }

    pub async fn execute<'a>(&'a self, target: &'a ActionTarget<'a>) -> Result<(), ActionError> {
        self.inner.execute_boxed(target).await
    }
}

/// Mapping from action kind to handler.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<CompensationKind, BoxActionHandler>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: ActionHandler + 'static>(mut self, handler: T) -> Self {
        let kind = ActionHandler::kind(&handler);
        self.handlers.insert(kind, BoxActionHandler::new(handler));
        self
    }

    /// The built-in handlers: proxy calls, monetary reversals, notification events.
    pub fn standard<P, E>(proxy: Arc<P>, publisher: Arc<E>, config: &CompensationConfig) -> Self
    where
        P: ExternalCallProxy + 'static,
        E: EventPublisher + 'static,
    {
        ActionRegistry::new()
            .with(ServiceCallAction::new(proxy.clone()))
            .with(ReversalAction::new(
                CompensationKind::WalletReverse,
                config.wallet_reverse_method.clone(),
                proxy.clone(),
            ))
            .with(ReversalAction::new(
                CompensationKind::PaymentRefund,
                config.payment_refund_method.clone(),
                proxy,
            ))
            .with(CustomEventAction::new(publisher))
    }

    pub async fn execute(&self, target: &ActionTarget<'_>) -> Result<(), ActionError> {
        let kind = target.action.kind();
        match self.handlers.get(&kind) {
            Some(handler) => handler.execute(target).await,
            None => Err(ActionError::NoHandler(kind)),
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in actions
// ---------------------------------------------------------------------------

async fn invoke<P: ExternalCallProxy>(proxy: &P, call: ServiceCall) -> Result<(), ActionError> {
    match proxy.invoke(&call).await {
        Ok(response) if response.success => Ok(()),
        Ok(response) => Err(ActionError::Failed(format!(
            "{} answered {}: {}",
            call.method_id,
            response.status_code,
            response.error.unwrap_or_default()
        ))),
        Err(e) => Err(ActionError::Failed(format!("{}: {e}", call.method_id))),
    }
}

/// `service_call`: invoke a reversing method through the proxy.
pub struct ServiceCallAction<P> {
    proxy: Arc<P>,
}

impl<P> ServiceCallAction<P> {
    pub fn new(proxy: Arc<P>) -> Self {
        Self { proxy }
    }
}

impl<P: ExternalCallProxy> ActionHandler for ServiceCallAction<P> {
    fn kind(&self) -> CompensationKind {
        CompensationKind::ServiceCall
    }

    async fn execute(&self, target: &ActionTarget<'_>) -> Result<(), ActionError> {
        let CompensationAction::ServiceCall { method_id, params } = target.action else {
            return Err(ActionError::Mismatch {
                kind: CompensationKind::ServiceCall,
                actual: target.action.kind(),
            });
        };
        let call = ServiceCall {
            method_id: method_id.clone(),
            params: target.context.render(params),
            idempotency_key: Some(target.action_key.to_string()),
        };
        invoke(self.proxy.as_ref(), call).await
    }
}

/// `wallet_reverse` / `payment_refund`: call the configured reversal method
/// with the original step's response attached.
pub struct ReversalAction<P> {
    kind: CompensationKind,
    method_id: String,
    proxy: Arc<P>,
}

impl<P> ReversalAction<P> {
    pub fn new(kind: CompensationKind, method_id: String, proxy: Arc<P>) -> Self {
        Self {
            kind,
            method_id,
            proxy,
        }
    }
}

impl<P: ExternalCallProxy> ActionHandler for ReversalAction<P> {
    fn kind(&self) -> CompensationKind {
        self.kind
    }

    async fn execute(&self, target: &ActionTarget<'_>) -> Result<(), ActionError> {
        let config = match target.action {
            CompensationAction::WalletReverse { config } | CompensationAction::PaymentRefund { config }
                if target.action.kind() == self.kind =>
            {
                config
            }
            other => {
                return Err(ActionError::Mismatch {
                    kind: self.kind,
                    actual: other.kind(),
                });
            }
        };
        let call = ServiceCall {
            method_id: self.method_id.clone(),
            params: json!({
                "run_id": target.run.id,
                "step_key": target.step.step_key,
                "config": target.context.render(config),
                "original": target.step.response_payload.clone().unwrap_or(Value::Null),
            }),
            idempotency_key: Some(target.action_key.to_string()),
        };
        invoke(self.proxy.as_ref(), call).await
    }
}

/// `custom_event`: publish a notification that a step was compensated.
pub struct CustomEventAction<E> {
    publisher: Arc<E>,
}

impl<E> CustomEventAction<E> {
    pub fn new(publisher: Arc<E>) -> Self {
        Self { publisher }
    }
}

impl<E: EventPublisher> ActionHandler for CustomEventAction<E> {
    fn kind(&self) -> CompensationKind {
        CompensationKind::CustomEvent
    }

    async fn execute(&self, target: &ActionTarget<'_>) -> Result<(), ActionError> {
        let CompensationAction::CustomEvent { event_name, config } = target.action else {
            return Err(ActionError::Mismatch {
                kind: CompensationKind::CustomEvent,
                actual: target.action.kind(),
            });
        };
        let event = IntegrationEvent::Custom {
            name: event_name.clone(),
            run_id: Some(target.run.id),
            correlation_id: target.run.correlation_id.clone(),
            payload: json!({
                "run_id": target.run.id,
                "step_id": target.step.step_key,
                "action": "compensation",
                "config": target.context.render(config),
            }),
        };
        self.publisher
            .publish(event)
            .await
            .map_err(|e| ActionError::Failed(format!("publishing {event_name}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Compensator
// ---------------------------------------------------------------------------

/// What one compensation pass did.
#[derive(Debug, Clone)]
pub struct CompensationSummary {
    pub run: WorkflowRun,
    /// Actions invoked during this pass.
    pub invoked: u32,
    /// Actions skipped because an earlier pass already ran them.
    pub skipped: u32,
    /// `step 'x' action #i (kind): reason` for each failed action.
    pub failures: Vec<String>,
    /// Actions held by another executor; the run stays Compensating.
    pub pending: u32,
}

enum ActionResult {
    Ran(CompensationStatus, Option<String>),
    AlreadyRan,
    Pending,
}

/// Drives runs through Compensating to Compensated.
pub struct Compensator<S> {
    interpreter: Interpreter<S>,
    actions: Arc<ActionRegistry>,
    config: CompensationConfig,
}

impl<S> Clone for Compensator<S> {
    fn clone(&self) -> Self {
        Self {
            interpreter: self.interpreter.clone(),
            actions: self.actions.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: WorkflowStore + 'static> Compensator<S> {
    pub fn new(interpreter: Interpreter<S>, actions: ActionRegistry) -> Self {
        let config = interpreter.config().compensation.clone();
        Self {
            interpreter,
            actions: Arc::new(actions),
            config,
        }
    }

    /// Compensate a Failed, Cancelled, or (resumed) Compensating run.
    pub async fn compensate(&self, run_id: Uuid) -> Result<CompensationSummary, EngineError> {
        let run = self.interpreter.load_run(run_id).await?;
        if matches!(run.status, RunStatus::Failed | RunStatus::Cancelled) {
            self.interpreter
                .commit_with_retry(run, |latest| {
                    matches!(latest.status, RunStatus::Failed | RunStatus::Cancelled).then(|| {
                        let mut next = latest.clone();
                        next.status = RunStatus::Compensating;
                        Commit::run(next)
                    })
                })
                .await?;
        }

        let run = self.interpreter.load_run(run_id).await?;
        let mut summary = CompensationSummary {
            run: run.clone(),
            invoked: 0,
            skipped: 0,
            failures: Vec::new(),
            pending: 0,
        };
        match run.status {
            RunStatus::Compensating => {}
            RunStatus::Compensated => return Ok(summary),
            other => {
                return Err(EngineError::InvalidTransition {
                    run_id,
                    reason: format!("cannot compensate a {other} run"),
                });
            }
        }

        let dsl = self
            .interpreter
            .load_dsl(&run.definition_code, run.version_number)
            .await?;
        let store = self.interpreter.store();

        let mut completed: Vec<WorkflowRunStep> = store
            .list_steps(&run_id)
            .await?
            .into_iter()
            .filter(|s| s.status == StepStatus::Completed)
            .collect();
        completed.sort_by(|a, b| {
            b.ended_at
                .cmp(&a.ended_at)
                .then_with(|| b.started_at.cmp(&a.started_at))
        });

        let recorded: HashSet<(Uuid, u32)> = store
            .list_compensations(&run_id)
            .await?
            .into_iter()
            .map(|c| (c.run_step_id, c.action_index))
            .collect();
        let context = RunContext::from_value(run.input_context.clone());

        for step in &completed {
            let Some(spec) = dsl.step(&step.step_key) else {
                continue;
            };
            for (index, action) in spec.compensation.iter().enumerate() {
                let index = index as u32;
                if recorded.contains(&(step.id, index)) {
                    summary.skipped += 1;
                    continue;
                }
                match self.run_action(&run, step, index, action, &context).await? {
                    ActionResult::Ran(status, error) => {
                        summary.invoked += 1;
                        if status == CompensationStatus::Failed {
                            summary.failures.push(format!(
                                "step '{}' action #{index} ({}): {}",
                                step.step_key,
                                action.kind(),
                                error.unwrap_or_default()
                            ));
                        }
                    }
                    ActionResult::AlreadyRan => summary.skipped += 1,
                    ActionResult::Pending => summary.pending += 1,
                }
            }
        }

        if summary.pending > 0 {
            tracing::info!(run_id = %run_id, pending = summary.pending, "compensation actions held elsewhere, run stays compensating");
            return Ok(summary);
        }

        let failures = summary.failures.clone();
        let finished = self
            .interpreter
            .commit_with_retry(run, |latest| {
                (latest.status == RunStatus::Compensating).then(|| {
                    let mut next = latest.clone();
                    next.status = RunStatus::Compensated;
                    next.ended_at = Some(Utc::now());
                    if !failures.is_empty() {
                        let report = format!("compensation failures: {}", failures.join("; "));
                        next.last_error = Some(match &latest.last_error {
                            Some(previous) => format!("{previous}; {report}"),
                            None => report,
                        });
                    }
                    Commit::run(next)
                })
            })
            .await?;

        summary.run = match finished {
            Some(run) => run,
            None => self.interpreter.load_run(run_id).await?,
        };
        tracing::info!(
            run_id = %run_id,
            invoked = summary.invoked,
            skipped = summary.skipped,
            failed = summary.failures.len(),
            "run compensated"
        );
        Ok(summary)
    }

    async fn run_action(
        &self,
        run: &WorkflowRun,
        step: &WorkflowRunStep,
        index: u32,
        action: &CompensationAction,
        context: &RunContext,
    ) -> Result<ActionResult, EngineError> {
        let key = action_key(run.id, step.id, index);
        let guard = self.interpreter.guard();
        let slot = SlotKey::new(
            COMPENSATION_ROUTE,
            &key,
            self.interpreter.hasher().hash_value(&serde_json::to_value(action)?),
        );

        match guard.check_or_reserve(&slot).await? {
            IdempotencyCheck::Reserved => {}
            IdempotencyCheck::PriorResponse { response, .. } => {
                // The action ran but its log row may not have landed.
                let status = response
                    .get("status")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(CompensationStatus::Succeeded);
                let attempts = response.get("attempts").and_then(Value::as_u64).unwrap_or(1) as u32;
                let error = response.get("error").and_then(Value::as_str).map(str::to_string);
                let row = log_row(run, step, index, action, status, attempts, error);
                if self.interpreter.store().record_compensation(&row).await? {
                    tracing::info!(run_id = %run.id, step_key = %step.step_key, index, "backfilled compensation log from recorded response");
                }
                return Ok(ActionResult::AlreadyRan);
            }
            IdempotencyCheck::InFlight { .. } => return Ok(ActionResult::Pending),
        }

        let target = ActionTarget {
            run,
            step,
            action,
            action_key: &key,
            context,
        };
        let max_attempts = self.config.max_action_attempts.max(1);
        let mut attempts = 0;
        let mut error = None;
        while attempts < max_attempts {
            attempts += 1;
            match self.actions.execute(&target).await {
                Ok(()) => {
                    error = None;
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        run_id = %run.id,
                        step_key = %step.step_key,
                        action = %action.kind(),
                        index,
                        attempt = attempts,
                        error = %e,
                        "compensation action failed"
                    );
                    error = Some(e.to_string());
                }
            }
        }

        let status = if error.is_some() {
            CompensationStatus::Failed
        } else {
            CompensationStatus::Succeeded
        };
        guard
            .record(
                &slot,
                &json!({ "status": status.as_str(), "attempts": attempts, "error": error }),
                200,
            )
            .await?;
        self.interpreter
            .store()
            .record_compensation(&log_row(run, step, index, action, status, attempts, error.clone()))
            .await?;

        tracing::debug!(run_id = %run.id, step_key = %step.step_key, index, status = status.as_str(), "compensation action recorded");
        Ok(ActionResult::Ran(status, error))
    }
}

fn log_row(
    run: &WorkflowRun,
    step: &WorkflowRunStep,
    index: u32,
    action: &CompensationAction,
    status: CompensationStatus,
    attempts: u32,
    error: Option<String>,
) -> CompensationRecord {
    CompensationRecord {
        id: Uuid::now_v7(),
        run_id: run.id,
        run_step_id: step.id,
        step_key: step.step_key.clone(),
        action_index: index,
        kind: action.kind().to_string(),
        status,
        attempts,
        error,
        executed_at: Utc::now(),
    }
}
