//! Workflow engine facade.
//!
//! `WorkflowEngine` owns the interpreter, the compensator and the signal
//! router, and exposes the external operations: start, signal, resume,
//! cancel, compensate and the run queries. It drives runs step by step
//! until they pause or finish, feeding finished child runs back to the
//! parents waiting on them.
//!
//! At most one driver advances a given run inside this process; the
//! `drivers` map holds a cancellation token per driven run so `cancel`
//! can interrupt a step in flight.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_types::config::EngineConfig;
use conductor_types::dsl::{SUB_WORKFLOW_COMPLETED_SIGNAL, SUB_WORKFLOW_FAILED_SIGNAL};
use conductor_types::idempotency::{IdempotencyCheck, START_ROUTE};
use conductor_types::run::{RunFilter, RunHistory, RunStatus, StepStatus, WorkflowRun};

use crate::event::{EngineEvent, EventBus};
use crate::gateway::{EventPublisher, ExternalCallProxy, HumanTaskGateway};
use crate::repository::WorkflowStore;
use crate::service::hash::BodyHasher;

use super::compensation::{ActionRegistry, CompensationSummary, Compensator};
use super::context::RunContext;
use super::error::EngineError;
use super::handler::StepHandlerRegistry;
use super::idempotency::SlotKey;
use super::interpreter::{Advance, Commit, Interpreter, WaitResolution};
use super::signal::{SignalDelivery, SignalOutcome, SignalRouter};

/// Prefix of `last_error` on cancelled runs.
const CANCELLED_PREFIX: &str = "cancelled: ";

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Parameters for starting a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub definition_code: String,
    /// Explicit version; `None` means the latest Published one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub initiated_by: String,
}

impl StartRequest {
    pub fn new(definition_code: impl Into<String>, input: Value) -> Self {
        Self {
            definition_code: definition_code.into(),
            version: None,
            input,
            correlation_id: None,
            initiated_by: "system".to_string(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn initiated_by(mut self, actor: impl Into<String>) -> Self {
        self.initiated_by = actor.into();
        self
    }

    /// The part of the request a duplicate must repeat exactly.
    fn fingerprint(&self) -> Value {
        json!({
            "definition_code": self.definition_code,
            "version": self.version,
            "input": self.input,
            "correlation_id": self.correlation_id,
        })
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

struct EngineInner<S> {
    interpreter: Interpreter<S>,
    compensator: Compensator<S>,
    router: SignalRouter<S>,
    drivers: DashMap<Uuid, CancellationToken>,
}

/// Entry point for every run operation. Cheap to clone.
pub struct WorkflowEngine<S> {
    inner: Arc<EngineInner<S>>,
}

impl<S> Clone for WorkflowEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: WorkflowStore + 'static> WorkflowEngine<S> {
    pub fn new(
        store: Arc<S>,
        steps: StepHandlerRegistry,
        actions: ActionRegistry,
        hasher: Arc<dyn BodyHasher>,
        config: EngineConfig,
    ) -> Self {
        let events = EventBus::new(config.event_bus_capacity.max(1));
        let interpreter = Interpreter::new(store, steps, hasher, Arc::new(config), events);
        let compensator = Compensator::new(interpreter.clone(), actions);
        let router = SignalRouter::new(interpreter.clone());
        Self {
            inner: Arc::new(EngineInner {
                interpreter,
                compensator,
                router,
                drivers: DashMap::new(),
            }),
        }
    }

    /// An engine with the built-in step handlers and compensation actions.
    pub fn standard<P, G, E>(
        store: Arc<S>,
        proxy: Arc<P>,
        gateway: Arc<G>,
        publisher: Arc<E>,
        hasher: Arc<dyn BodyHasher>,
        config: EngineConfig,
    ) -> Self
    where
        P: ExternalCallProxy + 'static,
        G: HumanTaskGateway + 'static,
        E: EventPublisher + 'static,
    {
        let steps = StepHandlerRegistry::standard(proxy.clone(), gateway, publisher.clone());
        let actions = ActionRegistry::standard(proxy, publisher, &config.compensation);
        Self::new(store, steps, actions, hasher, config)
    }

    pub fn store(&self) -> &Arc<S> {
        self.inner.interpreter.store()
    }

    pub fn config(&self) -> &EngineConfig {
        self.inner.interpreter.config()
    }

    /// Subscribe to run lifecycle notifications.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.interpreter.events().subscribe()
    }

    /// Whether this process is currently driving `run_id`.
    pub fn is_driving(&self, run_id: Uuid) -> bool {
        self.inner.drivers.contains_key(&run_id)
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Create a run on the resolved version and drive it until it pauses
    /// or finishes.
    pub async fn start(&self, request: StartRequest) -> Result<WorkflowRun, EngineError> {
        let run = self.create_run(&request).await?;
        let run = self.drive(run.id).await?;
        settled(run)
    }

    /// Start at most one run per idempotency key and request body.
    ///
    /// A duplicate returns the run created by the first caller in whatever
    /// state it is now; a duplicate racing the first caller waits for it.
    pub async fn start_idempotent(
        &self,
        key: &str,
        request: StartRequest,
    ) -> Result<WorkflowRun, EngineError> {
        let interpreter = &self.inner.interpreter;
        let guard = interpreter.guard();
        let slot = SlotKey::new(
            START_ROUTE,
            key,
            interpreter.hasher().hash_value(&request.fingerprint()),
        );

        let prior = match guard.check_or_reserve(&slot).await? {
            IdempotencyCheck::Reserved => None,
            IdempotencyCheck::PriorResponse { response, .. } => Some(response),
            IdempotencyCheck::InFlight { .. } => match guard.await_response(&slot).await? {
                Some((response, _)) => Some(response),
                None => {
                    return Err(EngineError::IdempotencyInFlight {
                        key: key.to_string(),
                    })
                }
            },
        };
        if let Some(response) = prior {
            let run_id = recorded_run_id(&response)?;
            tracing::debug!(key, run_id = %run_id, "duplicate start, returning existing run");
            return interpreter.load_run(run_id).await;
        }

        let run = match self.create_run(&request).await {
            Ok(run) => run,
            Err(e) => {
                guard.release(&slot).await?;
                return Err(e);
            }
        };
        // Recorded before driving so duplicates see the run while it executes.
        guard.record(&slot, &json!({ "run_id": run.id }), 201).await?;

        let run = self.drive(run.id).await?;
        settled(run)
    }

    async fn create_run(&self, request: &StartRequest) -> Result<WorkflowRun, EngineError> {
        if request.definition_code.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "definition code must not be empty".to_string(),
            ));
        }
        if !(request.input.is_object() || request.input.is_null()) {
            return Err(EngineError::InvalidRequest(
                "input must be a JSON object".to_string(),
            ));
        }

        let interpreter = &self.inner.interpreter;
        let version = interpreter
            .resolve_version(&request.definition_code, request.version)
            .await?;
        let context = RunContext::from_value(request.input.clone());
        context
            .check_size()
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;

        let run = WorkflowRun::new(
            &request.definition_code,
            version.version_number,
            context.into_value(),
            request.correlation_id.clone(),
            &request.initiated_by,
        );
        interpreter.store().create_run(&run).await?;

        tracing::info!(
            run_id = %run.id,
            definition = %run.definition_code,
            version = run.version_number,
            correlation_id = ?run.correlation_id,
            initiated_by = %run.initiated_by,
            "run created"
        );
        Ok(run)
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    /// Advance `run_id` (and any runs its steps touched) until each pauses
    /// or finishes. Returns the run's state afterwards.
    pub async fn drive(&self, run_id: Uuid) -> Result<WorkflowRun, EngineError> {
        let mut queue = VecDeque::from([run_id]);
        while let Some(next) = queue.pop_front() {
            match self.drive_one(next, &mut queue).await {
                Ok(()) => {}
                Err(e) if next == run_id => return Err(e),
                Err(e) => {
                    tracing::warn!(run_id = %next, error = %e, "driving related run failed");
                }
            }
        }
        self.inner.interpreter.load_run(run_id).await
    }

    async fn drive_one(&self, run_id: Uuid, queue: &mut VecDeque<Uuid>) -> Result<(), EngineError> {
        let token = CancellationToken::new();
        let claimed = match self.inner.drivers.entry(run_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
                true
            }
        };
        if !claimed {
            tracing::debug!(run_id = %run_id, "run already being driven");
            return Ok(());
        }

        let result = self.advance(run_id, &token, queue).await;
        self.inner.drivers.remove(&run_id);
        let run = result?;

        // Cancelled runs are finished by `cancel` itself.
        if matches!(run.status, RunStatus::Completed | RunStatus::Failed) {
            self.finish(&run, queue).await?;
        }
        Ok(())
    }

    async fn advance(
        &self,
        run_id: Uuid,
        token: &CancellationToken,
        queue: &mut VecDeque<Uuid>,
    ) -> Result<WorkflowRun, EngineError> {
        let interpreter = &self.inner.interpreter;
        loop {
            let run = interpreter.load_run(run_id).await?;
            match run.status {
                RunStatus::Pending => {
                    interpreter.begin(run).await?;
                }
                RunStatus::Running => {
                    let Some(step_key) = run.current_step.clone() else {
                        return Err(EngineError::InvalidTransition {
                            run_id,
                            reason: "running run is not positioned on a step".to_string(),
                        });
                    };
                    let report = interpreter.execute(run_id, &step_key, token).await?;
                    queue.extend(report.spawned);
                    match report.advance {
                        Advance::Retry { delay } => {
                            tokio::select! {
                                _ = token.cancelled() => {}
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        // Left to the slot's owner; the sweeper retries later.
                        Advance::Held => return interpreter.load_run(run_id).await,
                        _ => {}
                    }
                }
                _ => return Ok(run),
            }
        }
    }

    /// Follow-up work for a run that just reached Completed, Failed or Cancelled.
    async fn finish(&self, run: &WorkflowRun, queue: &mut VecDeque<Uuid>) -> Result<(), EngineError> {
        if matches!(run.status, RunStatus::Failed | RunStatus::Cancelled) {
            self.schedule_compensation(run.id).await;
        }
        if let Some(parent_id) = run.parent_run_id {
            self.notify_parent(parent_id, run, queue).await?;
        }
        Ok(())
    }

    async fn schedule_compensation(&self, run_id: Uuid) {
        let compensator = self.inner.compensator.clone();
        if self.config().compensation.background {
            tokio::spawn(async move {
                if let Err(e) = compensator.compensate(run_id).await {
                    tracing::error!(run_id = %run_id, error = %e, "background compensation failed");
                }
            });
        } else if let Err(e) = compensator.compensate(run_id).await {
            tracing::error!(run_id = %run_id, error = %e, "compensation failed");
        }
    }

    /// Resume a parent paused on this child, if it still is.
    async fn notify_parent(
        &self,
        parent_id: Uuid,
        child: &WorkflowRun,
        queue: &mut VecDeque<Uuid>,
    ) -> Result<(), EngineError> {
        let signal = match child.status {
            RunStatus::Completed => SUB_WORKFLOW_COMPLETED_SIGNAL,
            RunStatus::Failed | RunStatus::Cancelled => SUB_WORKFLOW_FAILED_SIGNAL,
            _ => return Ok(()),
        };
        let store = self.store();
        let Some(parent) = store.get_run(&parent_id).await? else {
            tracing::warn!(run_id = %child.id, parent_run_id = %parent_id, "parent run not found");
            return Ok(());
        };
        let Some(wait) = parent.waiting.as_ref().filter(|_| parent.status == RunStatus::Waiting) else {
            return Ok(());
        };
        let waits_on_child = store
            .list_steps(&parent_id)
            .await?
            .iter()
            .find(|s| s.id == wait.run_step_id)
            .and_then(|s| s.response_payload.as_ref())
            .and_then(|p| p.get("child_run_id"))
            .and_then(Value::as_str)
            == Some(child.id.to_string().as_str());
        if !waits_on_child {
            return Ok(());
        }

        let payload = json!({
            "sub_workflow": {
                "run_id": child.id,
                "definition_code": child.definition_code,
                "status": child.status,
                "output": child.output_context,
                "error": child.last_error,
            }
        });
        let outcome = self.inner.router.deliver(parent_id, signal, payload).await?;
        if outcome.is_accepted() {
            queue.push_back(parent_id);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------------

    /// Deliver a signal to one run and drive it if the signal resumed it.
    pub async fn signal(
        &self,
        run_id: Uuid,
        name: &str,
        payload: Value,
    ) -> Result<SignalOutcome, EngineError> {
        let outcome = self.inner.router.deliver(run_id, name, payload).await?;
        self.after_signal(run_id, outcome).await
    }

    /// Deliver a signal to the runs carrying `correlation_id`.
    pub async fn signal_by_correlation(
        &self,
        correlation_id: &str,
        name: &str,
        payload: Value,
    ) -> Result<Vec<SignalDelivery>, EngineError> {
        let deliveries = self
            .inner
            .router
            .deliver_by_correlation(correlation_id, name, payload)
            .await?;
        let mut driven = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            let outcome = self.after_signal(delivery.run_id, delivery.outcome).await?;
            driven.push(SignalDelivery {
                run_id: delivery.run_id,
                outcome,
            });
        }
        Ok(driven)
    }

    async fn after_signal(
        &self,
        run_id: Uuid,
        outcome: SignalOutcome,
    ) -> Result<SignalOutcome, EngineError> {
        if !outcome.is_accepted() {
            return Ok(outcome);
        }
        let run = self.drive(run_id).await?;
        Ok(SignalOutcome::Accepted { status: run.status })
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    /// Continue a paused or stalled run, merging `delta` into its context.
    ///
    /// A Waiting run has its paused step completed with `delta` whatever it
    /// was waiting for. A Pending or Running run (e.g. left behind by a dead
    /// process) is driven again after the merge.
    pub async fn resume(&self, run_id: Uuid, delta: Value) -> Result<WorkflowRun, EngineError> {
        if !(delta.is_object() || delta.is_null()) {
            return Err(EngineError::InvalidRequest(
                "context delta must be a JSON object".to_string(),
            ));
        }
        let interpreter = &self.inner.interpreter;
        let run = interpreter.load_run(run_id).await?;

        match run.status {
            RunStatus::Waiting => {
                let advance = interpreter
                    .resolve_wait(run, WaitResolution::Manual { payload: delta })
                    .await?;
                if advance == Advance::Abandoned {
                    let current = interpreter.load_run(run_id).await?;
                    return Err(EngineError::InvalidTransition {
                        run_id,
                        reason: format!("run moved to {} while resuming", current.status),
                    });
                }
            }
            RunStatus::Pending | RunStatus::Running => {
                if delta.as_object().is_some_and(|d| !d.is_empty()) {
                    interpreter
                        .commit_with_retry(run, |latest| {
                            matches!(latest.status, RunStatus::Pending | RunStatus::Running).then(|| {
                                let mut next = latest.clone();
                                let mut context = RunContext::from_value(next.input_context.clone());
                                context.merge(&delta);
                                next.input_context = context.into_value();
                                Commit::run(next)
                            })
                        })
                        .await?;
                }
            }
            status => {
                return Err(EngineError::InvalidTransition {
                    run_id,
                    reason: format!("cannot resume a {status} run"),
                });
            }
        }

        tracing::info!(run_id = %run_id, "run resumed");
        let run = self.drive(run_id).await?;
        settled(run)
    }

    /// Stop an active run and compensate what it completed.
    ///
    /// Cancelling a run that is already finished is a no-op.
    pub async fn cancel(&self, run_id: Uuid, reason: &str) -> Result<WorkflowRun, EngineError> {
        let interpreter = &self.inner.interpreter;
        let run = interpreter.load_run(run_id).await?;
        if !run.status.is_active() {
            tracing::info!(run_id = %run_id, status = %run.status, "cancel ignored, run not active");
            return Ok(run);
        }

        let last_error = format!("{CANCELLED_PREFIX}{reason}");
        let committed = interpreter
            .commit_with_retry(run, |latest| {
                latest.status.is_active().then(|| {
                    let mut next = latest.clone();
                    next.status = RunStatus::Cancelled;
                    next.waiting = None;
                    next.last_error = Some(last_error.clone());
                    next.ended_at = Some(Utc::now());
                    Commit::run(next)
                })
            })
            .await?;
        let Some(run) = committed else {
            return interpreter.load_run(run_id).await;
        };

        if let Some(token) = self.inner.drivers.get(&run_id) {
            token.cancel();
        }

        let store = self.store();
        for mut step in store
            .list_steps(&run_id)
            .await?
            .into_iter()
            .filter(|s| s.status == StepStatus::Running)
        {
            step.status = StepStatus::Skipped;
            step.error = Some("run cancelled".to_string());
            step.ended_at = Some(Utc::now());
            store.save_step(&step).await?;
        }
        tracing::info!(run_id = %run_id, reason, "run cancelled");

        let mut queue = VecDeque::new();
        self.finish(&run, &mut queue).await?;
        while let Some(next) = queue.pop_front() {
            if let Err(e) = self.drive_one(next, &mut queue).await {
                tracing::warn!(run_id = %next, error = %e, "driving related run failed");
            }
        }
        interpreter.load_run(run_id).await
    }

    /// Run (or continue) compensation for a Failed, Cancelled or
    /// Compensating run. Already-executed actions are skipped.
    pub async fn compensate(&self, run_id: Uuid) -> Result<CompensationSummary, EngineError> {
        self.inner.compensator.compensate(run_id).await
    }

    // -----------------------------------------------------------------------
    // Deadlines and recovery
    // -----------------------------------------------------------------------

    /// Resolve the wait of `run_id` if its deadline has passed.
    ///
    /// Returns the run after driving, or `None` when nothing was due.
    pub async fn expire_wait(&self, run_id: Uuid) -> Result<Option<WorkflowRun>, EngineError> {
        let interpreter = &self.inner.interpreter;
        let run = interpreter.load_run(run_id).await?;
        let due = run.status == RunStatus::Waiting
            && run
                .waiting
                .as_ref()
                .and_then(|w| w.deadline)
                .is_some_and(|deadline| deadline <= Utc::now());
        if !due {
            return Ok(None);
        }

        let advance = interpreter
            .resolve_wait(run, WaitResolution::DeadlinePassed)
            .await?;
        if advance == Advance::Abandoned {
            return Ok(None);
        }
        tracing::info!(run_id = %run_id, "wait deadline passed");
        Ok(Some(self.drive(run_id).await?))
    }

    /// Pick up a run another process stopped driving.
    pub async fn recover(&self, run_id: Uuid) -> Result<WorkflowRun, EngineError> {
        if self.is_driving(run_id) {
            return self.inner.interpreter.load_run(run_id).await;
        }
        let run = self.inner.interpreter.load_run(run_id).await?;
        match run.status {
            RunStatus::Pending | RunStatus::Running => self.drive(run_id).await,
            RunStatus::Compensating => Ok(self.compensate(run_id).await?.run),
            _ => Ok(run),
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, EngineError> {
        self.inner.interpreter.load_run(run_id).await
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, EngineError> {
        Ok(self.store().list_runs(filter).await?)
    }

    /// The run together with its step attempts, signals, transitions and
    /// compensation records, each in the order they happened.
    pub async fn get_history(&self, run_id: Uuid) -> Result<RunHistory, EngineError> {
        let run = self.inner.interpreter.load_run(run_id).await?;
        let store = self.store();

        let mut steps = store.list_steps(&run_id).await?;
        steps.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.attempt.cmp(&b.attempt)));
        let mut signals = store.list_signals(&run_id).await?;
        signals.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        let mut transitions = store.list_transitions(&run_id).await?;
        transitions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut compensations = store.list_compensations(&run_id).await?;
        compensations.sort_by(|a, b| a.executed_at.cmp(&b.executed_at));

        Ok(RunHistory {
            run,
            steps,
            signals,
            transitions,
            compensations,
        })
    }
}

/// Map a run that stopped on a failure to `StepExecutionFailed`.
fn settled(run: WorkflowRun) -> Result<WorkflowRun, EngineError> {
    let failed = matches!(
        run.status,
        RunStatus::Failed | RunStatus::Compensating | RunStatus::Compensated
    );
    let cancelled = run
        .last_error
        .as_deref()
        .is_some_and(|e| e.starts_with(CANCELLED_PREFIX));
    if failed && !cancelled {
        return Err(EngineError::StepExecutionFailed {
            run_id: run.id,
            step_key: run.current_step.clone().unwrap_or_default(),
            reason: run.last_error.clone().unwrap_or_default(),
        });
    }
    Ok(run)
}

fn recorded_run_id(response: &Value) -> Result<Uuid, EngineError> {
    response
        .get("run_id")
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())
        .ok_or_else(|| {
            EngineError::InvalidRequest("recorded start response carries no run id".to_string())
        })
}
