//! Step interpreter: executes one step of a run and persists the outcome.
//!
//! `execute(run_id, step_key)` loads the run and its pinned DSL, dispatches
//! the step to its registered handler (behind the idempotency guard for
//! side-effecting types), and commits the resulting transition together
//! with the context mutation in a single version-checked write. That write
//! is the durability checkpoint: nothing else is dispatched before it lands.
//!
//! Every run-row write goes through `commit_with_retry`, which re-reads the
//! run on a version mismatch and re-plans the write against the fresh state,
//! or abandons it when the run has moved on.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_types::config::EngineConfig;
use conductor_types::definition::{VersionStatus, WorkflowDefinitionVersion};
use conductor_types::dsl::{StepSpec, WorkflowDsl};
use conductor_types::idempotency::IdempotencyCheck;
use conductor_types::run::{
    DeadlineAction, RunStatus, StepStatus, TransitionRecord, WaitState, WorkflowRun,
    WorkflowRunStep,
};

use crate::event::{EngineEvent, EventBus};
use crate::repository::WorkflowStore;
use crate::service::hash::BodyHasher;

use super::context::RunContext;
use super::error::EngineError;
use super::handler::{
    ChildRunLauncher, ChildRunRequest, NoChildRuns, Route, StepContext, StepFailure,
    StepHandlerRegistry, StepOutcome,
};
use super::idempotency::{IdempotencyGuard, SlotKey};
use super::retry::RetryHandler;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum sub-workflow nesting depth.
pub const MAX_SUB_WORKFLOW_DEPTH: u32 = 5;

/// `{run_id}:{step_key}:{attempt}`, stable across crash replays of one attempt.
pub fn execution_key(run_id: Uuid, step_key: &str, attempt: u32) -> String {
    format!("{run_id}:{step_key}:{attempt}")
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What the run does after a committed step.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// Positioned on its next step (or resumed from a wait).
    Continue,
    /// The same step runs again after `delay`.
    Retry { delay: Duration },
    /// The run is Waiting for a signal.
    Paused,
    /// The run reached Completed or Failed.
    Finished(RunStatus),
    /// The run moved on concurrently; nothing was committed.
    Abandoned,
    /// Another executor holds a fresh reservation for this attempt; nothing
    /// was dispatched. The run stays Running on the same step.
    Held,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub advance: Advance,
    /// Child runs created by this attempt, to be driven by the caller.
    pub spawned: Vec<Uuid>,
}

impl StepReport {
    fn new(advance: Advance) -> Self {
        Self {
            advance,
            spawned: Vec::new(),
        }
    }
}

/// How a paused step is resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitResolution {
    /// A signal arrived. It must be the awaited one or one of `fail_on`.
    Signal { name: String, payload: Value },
    /// The wait's deadline passed.
    DeadlinePassed,
    /// Operator resume: completes the step with `payload` whatever it awaits.
    Manual { payload: Value },
}

/// How one parallel branch ended.
enum BranchResult {
    Done(Value),
    Failed(String),
    Held,
}

/// One planned run-row write.
pub(crate) struct Commit {
    pub run: WorkflowRun,
    pub step: Option<WorkflowRunStep>,
    pub transition: Option<TransitionRecord>,
}

impl Commit {
    pub fn run(run: WorkflowRun) -> Self {
        Self {
            run,
            step: None,
            transition: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

/// Executes steps of runs against their pinned definition versions.
///
/// Cheap to clone: every field is shared.
pub struct Interpreter<S> {
    store: Arc<S>,
    handlers: Arc<StepHandlerRegistry>,
    hasher: Arc<dyn BodyHasher>,
    config: Arc<EngineConfig>,
    events: EventBus<EngineEvent>,
    /// DSL of non-draft versions, which can no longer change.
    dsl_cache: Arc<DashMap<(String, u32), Arc<WorkflowDsl>>>,
}

impl<S> Clone for Interpreter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            handlers: self.handlers.clone(),
            hasher: self.hasher.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            dsl_cache: self.dsl_cache.clone(),
        }
    }
}

impl<S: WorkflowStore + 'static> Interpreter<S> {
    pub fn new(
        store: Arc<S>,
        handlers: StepHandlerRegistry,
        hasher: Arc<dyn BodyHasher>,
        config: Arc<EngineConfig>,
        events: EventBus<EngineEvent>,
    ) -> Self {
        let missing = handlers.missing();
        if !missing.is_empty() {
            tracing::warn!(?missing, "step types without a registered handler");
        }
        Self {
            store,
            handlers: Arc::new(handlers),
            hasher,
            config,
            events,
            dsl_cache: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus<EngineEvent> {
        &self.events
    }

    pub fn hasher(&self) -> &dyn BodyHasher {
        self.hasher.as_ref()
    }

    pub fn guard(&self) -> IdempotencyGuard<S> {
        IdempotencyGuard::new(self.store.clone(), self.config.idempotency.clone())
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub async fn load_run(&self, run_id: Uuid) -> Result<WorkflowRun, EngineError> {
        self.store
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    /// The DSL of a specific version. Runs always read their pinned version.
    pub async fn load_dsl(&self, code: &str, version: u32) -> Result<Arc<WorkflowDsl>, EngineError> {
        let key = (code.to_string(), version);
        if let Some(cached) = self.dsl_cache.get(&key) {
            return Ok(cached.clone());
        }

        let stored = self
            .store
            .get_version(code, version)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound {
                code: code.to_string(),
                version: Some(version),
            })?;
        let dsl = Arc::new(stored.dsl);
        if stored.status != VersionStatus::Draft {
            self.dsl_cache.insert(key, dsl.clone());
        }
        Ok(dsl)
    }

    /// The version a new run should be pinned to.
    ///
    /// Without an explicit number this is the latest Published version;
    /// with `allow_draft_versions` the latest Draft is used when nothing is
    /// published.
    pub async fn resolve_version(
        &self,
        code: &str,
        requested: Option<u32>,
    ) -> Result<WorkflowDefinitionVersion, EngineError> {
        let allow_draft = self.config.allow_draft_versions;

        let version = match requested {
            Some(number) => self.store.get_version(code, number).await?.ok_or_else(|| {
                EngineError::DefinitionNotFound {
                    code: code.to_string(),
                    version: Some(number),
                }
            })?,
            None => match self.store.latest_published_version(code).await? {
                Some(published) => published,
                None => {
                    let versions = self.store.list_versions(code).await?;
                    let fallback = versions
                        .iter()
                        .rev()
                        .find(|v| v.is_startable(allow_draft))
                        .or_else(|| versions.last())
                        .cloned();
                    fallback.ok_or_else(|| EngineError::DefinitionNotFound {
                        code: code.to_string(),
                        version: None,
                    })?
                }
            },
        };

        if !version.is_startable(allow_draft) {
            return Err(EngineError::NotPublished {
                code: code.to_string(),
                version: version.version_number,
                status: version.status.to_string(),
            });
        }
        Ok(version)
    }

    // -----------------------------------------------------------------------
    // Commit helper
    // -----------------------------------------------------------------------

    /// Plan and write a run transition, re-reading and re-planning on
    /// version mismatch. `plan` returns `None` to abandon (the run moved on).
    pub(crate) async fn commit_with_retry<F>(
        &self,
        mut run: WorkflowRun,
        mut plan: F,
    ) -> Result<Option<WorkflowRun>, EngineError>
    where
        F: FnMut(&WorkflowRun) -> Option<Commit> + Send,
    {
        let run_id = run.id;
        for conflict in 0..=self.config.max_conflict_retries {
            let Some(mut commit) = plan(&run) else {
                return Ok(None);
            };
            let from = run.status;
            commit.run.updated_at = Utc::now();

            let result = self
                .store
                .commit_step(&commit.run, commit.step.as_ref(), commit.transition.as_ref())
                .await;
            match result {
                Ok(row_version) => {
                    commit.run.row_version = row_version;
                    let to = commit.run.status;
                    if from != to {
                        tracing::info!(run_id = %run_id, from = %from, to = %to, "run status changed");
                        self.events.publish(EngineEvent::RunStatusChanged { run_id, from, to });
                    }
                    return Ok(Some(commit.run));
                }
                Err(e) if e.is_version_mismatch() => {
                    tracing::debug!(run_id = %run_id, conflict, "run modified concurrently, re-reading");
                    run = self.load_run(run_id).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(run_id = %run_id, "optimistic concurrency retries exhausted");
        Err(EngineError::ConcurrencyConflict { run_id })
    }

    // -----------------------------------------------------------------------
    // Run start
    // -----------------------------------------------------------------------

    /// Move a Pending run to Running on its first step.
    pub async fn begin(&self, run: WorkflowRun) -> Result<Option<WorkflowRun>, EngineError> {
        let dsl = self.load_dsl(&run.definition_code, run.version_number).await?;
        let start_at = dsl.start_at.clone();
        self.commit_with_retry(run, |latest| {
            if latest.status != RunStatus::Pending {
                return None;
            }
            let mut next = latest.clone();
            next.status = RunStatus::Running;
            next.current_step = Some(start_at.clone());
            next.started_at = Some(Utc::now());
            Some(Commit {
                transition: Some(TransitionRecord::new(next.id, None, Some(start_at.clone()))),
                run: next,
                step: None,
            })
        })
        .await
    }

    /// Create a Pending child run on behalf of a sub-workflow step.
    pub async fn launch_child(&self, request: ChildRunRequest) -> Result<Uuid, EngineError> {
        let depth = self.nesting_depth(request.parent_run_id).await?;
        if depth >= MAX_SUB_WORKFLOW_DEPTH {
            return Err(EngineError::InvalidRequest(format!(
                "sub-workflow depth {} exceeds maximum {MAX_SUB_WORKFLOW_DEPTH}",
                depth + 1
            )));
        }

        let version = self
            .resolve_version(&request.definition_code, request.version)
            .await?;
        let mut child = WorkflowRun::new(
            &request.definition_code,
            version.version_number,
            RunContext::from_value(request.input).into_value(),
            request.correlation_id,
            request.initiated_by,
        );
        child.parent_run_id = Some(request.parent_run_id);
        self.store.create_run(&child).await?;

        tracing::info!(
            run_id = %child.id,
            parent_run_id = %request.parent_run_id,
            definition = %child.definition_code,
            version = child.version_number,
            "child run created"
        );
        Ok(child.id)
    }

    /// Number of ancestors of `run_id`, counting itself.
    async fn nesting_depth(&self, run_id: Uuid) -> Result<u32, EngineError> {
        let mut depth = 0;
        let mut current = Some(run_id);
        while let Some(id) = current {
            depth += 1;
            if depth > MAX_SUB_WORKFLOW_DEPTH {
                break;
            }
            current = self.store.get_run(&id).await?.and_then(|r| r.parent_run_id);
        }
        Ok(depth)
    }

    // -----------------------------------------------------------------------
    // Execute
    // -----------------------------------------------------------------------

    /// Execute `step_key` of a Running run positioned on it.
    pub async fn execute(
        &self,
        run_id: Uuid,
        step_key: &str,
        cancel: &CancellationToken,
    ) -> Result<StepReport, EngineError> {
        let run = self.load_run(run_id).await?;
        if run.status != RunStatus::Running || run.current_step.as_deref() != Some(step_key) {
            return Ok(StepReport::new(Advance::Abandoned));
        }

        let dsl = self.load_dsl(&run.definition_code, run.version_number).await?;
        let Some(step) = dsl.step(step_key) else {
            return Err(EngineError::InvalidTransition {
                run_id,
                reason: format!(
                    "step '{step_key}' does not exist in version {} of '{}'",
                    run.version_number, run.definition_code
                ),
            });
        };

        let history = self.store.list_steps(&run_id).await?;
        let same_key: Vec<&WorkflowRunStep> =
            history.iter().filter(|s| s.step_key == step_key).collect();

        // A Running record means the previous process died mid-attempt: adopt it.
        let (mut record, adopted) = match same_key.last() {
            Some(last) if last.status == StepStatus::Running => ((*last).clone(), true),
            _ => (
                WorkflowRunStep::start(run_id, step_key, step.step_type, same_key.len() as u32 + 1),
                false,
            ),
        };
        let key = execution_key(run_id, step_key, record.attempt);
        let context = RunContext::from_value(run.input_context.clone());
        if !adopted {
            record.idempotency_key = Some(key.clone());
            record.request_payload = Some(context.render(&serde_json::to_value(&step.config)?));
            self.store.save_step(&record).await?;
        }

        let consecutive_failures = same_key
            .iter()
            .rev()
            .filter(|s| s.id != record.id)
            .take_while(|s| s.status == StepStatus::Failed)
            .count() as u32;
        let budget_attempt = consecutive_failures + 1;

        tracing::debug!(
            run_id = %run_id,
            step_key,
            step_type = %step.step_type,
            attempt = record.attempt,
            adopted,
            "dispatching step"
        );

        let children = ChildRuns {
            interpreter: self,
            spawned: Mutex::new(Vec::new()),
        };
        let Some(mut outcome) = self
            .run_attempt(&run, step, record.attempt, &key, &context, &children, cancel)
            .await?
        else {
            return Ok(StepReport::new(Advance::Held));
        };

        if let StepOutcome::Completed {
            route: Route::FanOut { branches },
            ..
        } = &outcome
        {
            outcome = match self
                .fan_out(&run, &dsl, &record, branches, &context, &history, cancel)
                .await?
            {
                Some(joined) => joined,
                None => return Ok(StepReport::new(Advance::Held)),
            };
        }

        let spawned = children.spawned.into_inner().unwrap_or_default();
        let advance = self
            .commit_outcome(run, &dsl, step, record, outcome, budget_attempt)
            .await?;
        Ok(StepReport { advance, spawned })
    }

    /// Dispatch one attempt, behind the idempotency guard for side-effecting types.
    ///
    /// Returns `None` without dispatching while another executor holds an
    /// unanswered reservation for `key` that has not gone stale.
    #[allow(clippy::too_many_arguments)]
    async fn run_attempt(
        &self,
        run: &WorkflowRun,
        step: &StepSpec,
        attempt: u32,
        key: &str,
        context: &RunContext,
        children: &dyn ChildRunLauncher,
        cancel: &CancellationToken,
    ) -> Result<Option<StepOutcome>, EngineError> {
        if !step.step_type.is_side_effecting() {
            return Ok(Some(
                self.dispatch(run, step, attempt, key, context, children, cancel)
                    .await,
            ));
        }

        let guard = self.guard();
        let slot = SlotKey::new(
            format!("step.{}", step.step_type),
            key,
            self.hasher.hash_value(&serde_json::to_value(&step.config)?),
        );

        match guard.check_or_reserve(&slot).await? {
            IdempotencyCheck::PriorResponse { response, .. } => {
                match serde_json::from_value::<StepOutcome>(response) {
                    Ok(prior) => {
                        tracing::debug!(run_id = %run.id, step_key = %step.id, attempt, "replaying recorded step outcome");
                        return Ok(Some(prior));
                    }
                    Err(e) => {
                        tracing::warn!(run_id = %run.id, step_key = %step.id, error = %e, "unreadable recorded outcome, executing again");
                    }
                }
            }
            IdempotencyCheck::Reserved => {}
            // The guard takes the slot over once the reservation is older
            // than `idempotency.reservation_ttl_secs`.
            IdempotencyCheck::InFlight { reserved_at } => {
                tracing::info!(
                    run_id = %run.id,
                    step_key = %step.id,
                    attempt,
                    %reserved_at,
                    "step attempt held by another executor, not dispatching"
                );
                return Ok(None);
            }
        }

        let outcome = self
            .dispatch(run, step, attempt, key, context, children, cancel)
            .await;
        if outcome.is_failed() {
            guard.release(&slot).await?;
        } else {
            guard
                .record(&slot, &serde_json::to_value(&outcome)?, 200)
                .await?;
        }
        Ok(Some(outcome))
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        run: &WorkflowRun,
        step: &StepSpec,
        attempt: u32,
        key: &str,
        context: &RunContext,
        children: &dyn ChildRunLauncher,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let Some(handler) = self.handlers.get(step.step_type) else {
            return StepOutcome::fatal(format!("no handler registered for {}", step.step_type));
        };

        let ctx = StepContext {
            run,
            step,
            attempt,
            execution_key: key,
            context,
            children,
        };

        // Pausing steps use their timeout as the wait deadline instead.
        let timeout = step
            .timeout_secs
            .filter(|_| step.step_type.is_synchronous());

        let execution = async {
            match timeout {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), handler.execute(&ctx))
                    .await
                    .unwrap_or_else(|_| StepOutcome::retryable(format!("step timed out after {secs}s"))),
                None => handler.execute(&ctx).await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => StepOutcome::fatal("run cancelled"),
            outcome = execution => outcome,
        }
    }

    // -----------------------------------------------------------------------
    // Parallel fan-out
    // -----------------------------------------------------------------------

    /// Run the branches of a parallel step concurrently and join them.
    ///
    /// Outputs merge in declaration order. Any branch failing after its own
    /// retries fails the parallel step. Returns `None` when a branch attempt
    /// is held by another executor.
    #[allow(clippy::too_many_arguments)]
    async fn fan_out(
        &self,
        run: &WorkflowRun,
        dsl: &WorkflowDsl,
        parent: &WorkflowRunStep,
        branches: &[String],
        context: &RunContext,
        history: &[WorkflowRunStep],
        cancel: &CancellationToken,
    ) -> Result<Option<StepOutcome>, EngineError> {
        let mut outputs: Vec<Option<Value>> = vec![None; branches.len()];
        let mut set = JoinSet::new();

        for (idx, branch_id) in branches.iter().enumerate() {
            let Some(spec) = dsl.step(branch_id).cloned() else {
                return Ok(Some(StepOutcome::fatal(format!(
                    "parallel branch '{branch_id}' does not exist"
                ))));
            };
            let prior: Vec<&WorkflowRunStep> =
                history.iter().filter(|s| s.step_key == *branch_id).collect();

            // Already completed by an earlier execution of this fan-out.
            if let Some(done) = prior
                .iter()
                .rev()
                .find(|s| s.status == StepStatus::Completed && s.started_at >= parent.started_at)
            {
                outputs[idx] = Some(done.response_payload.clone().unwrap_or(Value::Null));
                continue;
            }

            // An attempt left Running by a dead executor keeps its execution key.
            let adopted = prior
                .last()
                .filter(|s| s.status == StepStatus::Running && s.started_at >= parent.started_at)
                .map(|s| (*s).clone());
            let first_attempt = adopted
                .as_ref()
                .map_or(prior.len() as u32 + 1, |s| s.attempt);

            let this = self.clone();
            let run = run.clone();
            let context = context.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let result = this
                    .run_branch(&run, &spec, first_attempt, adopted, &context, &cancel)
                    .await;
                (idx, result)
            });
        }

        let mut failure: Option<String> = None;
        let mut held = false;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, Ok(BranchResult::Done(output)))) => outputs[idx] = Some(output),
                Ok((idx, Ok(BranchResult::Failed(reason)))) => {
                    failure.get_or_insert_with(|| format!("parallel branch '{}' failed: {reason}", branches[idx]));
                }
                Ok((_, Ok(BranchResult::Held))) => held = true,
                Ok((_, Err(e))) => return Err(e),
                Err(e) => {
                    failure.get_or_insert_with(|| format!("parallel branch aborted: {e}"));
                }
            }
        }

        if let Some(reason) = failure {
            return Ok(Some(StepOutcome::fatal(reason)));
        }
        if held {
            return Ok(None);
        }

        let mut merged = Map::new();
        for output in outputs.into_iter().flatten() {
            if let Value::Object(fields) = output {
                merged.extend(fields);
            }
        }
        Ok(Some(StepOutcome::Completed {
            output: Some(Value::Object(merged)),
            route: Route::Next,
        }))
    }

    /// Execute one parallel branch with its own retry policy.
    ///
    /// `adopted` is a Running record of `first_attempt` to continue instead
    /// of starting a fresh one.
    async fn run_branch(
        &self,
        run: &WorkflowRun,
        spec: &StepSpec,
        first_attempt: u32,
        mut adopted: Option<WorkflowRunStep>,
        context: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<BranchResult, EngineError> {
        let policy = RetryHandler::policy_for(spec, &self.config);
        let mut attempt = first_attempt;
        let mut budget_attempt = 1;

        loop {
            let key = execution_key(run.id, &spec.id, attempt);
            let mut record = match adopted.take() {
                Some(record) => record,
                None => {
                    let mut record = WorkflowRunStep::start(run.id, &spec.id, spec.step_type, attempt);
                    record.idempotency_key = Some(key.clone());
                    record.request_payload = Some(context.render(&serde_json::to_value(&spec.config)?));
                    self.store.save_step(&record).await?;
                    record
                }
            };

            let Some(outcome) = self
                .run_attempt(run, spec, attempt, &key, context, &NoChildRuns, cancel)
                .await?
            else {
                return Ok(BranchResult::Held);
            };
            record.ended_at = Some(Utc::now());

            let failure = match outcome {
                StepOutcome::Completed { output, .. } => {
                    record.status = StepStatus::Completed;
                    record.response_payload = output.clone();
                    self.store.save_step(&record).await?;
                    self.events.publish(EngineEvent::StepCompleted {
                        run_id: run.id,
                        step_key: spec.id.clone(),
                        attempt,
                    });
                    return Ok(BranchResult::Done(output.unwrap_or(Value::Null)));
                }
                StepOutcome::Waiting(_) => StepFailure::Fatal("parallel branches cannot wait".to_string()),
                StepOutcome::Failed(failure) => failure,
            };

            record.status = StepStatus::Failed;
            record.error = Some(failure.reason().to_string());
            self.store.save_step(&record).await?;
            self.events.publish(EngineEvent::StepFailed {
                run_id: run.id,
                step_key: spec.id.clone(),
                attempt,
                error: failure.reason().to_string(),
            });

            if !RetryHandler::should_retry(&policy, budget_attempt, &failure) {
                return Ok(BranchResult::Failed(failure.reason().to_string()));
            }
            let delay = RetryHandler::backoff(&policy, budget_attempt);
            tracing::debug!(run_id = %run.id, step_key = %spec.id, attempt, ?delay, "retrying parallel branch");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(BranchResult::Failed("run cancelled".to_string())),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
            budget_attempt += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    async fn commit_outcome(
        &self,
        run: WorkflowRun,
        dsl: &WorkflowDsl,
        step: &StepSpec,
        record: WorkflowRunStep,
        outcome: StepOutcome,
        budget_attempt: u32,
    ) -> Result<Advance, EngineError> {
        let run_id = run.id;
        let step_key = step.id.clone();
        let policy = RetryHandler::policy_for(step, &self.config);

        // Decide everything that does not depend on the latest run row up front.
        let mut advance = Advance::Abandoned;
        let committed = self
            .commit_with_retry(run, |latest| {
                if latest.status != RunStatus::Running
                    || latest.current_step.as_deref() != Some(step_key.as_str())
                {
                    return None;
                }
                let now = Utc::now();
                let mut next = latest.clone();
                let mut record = record.clone();

                match &outcome {
                    StepOutcome::Completed { output, route } => {
                        let mut context = RunContext::from_value(next.input_context.clone());
                        if let Some(output) = output {
                            context.merge(output);
                        }
                        if let Err(e) = context.check_size() {
                            record.status = StepStatus::Failed;
                            record.error = Some(e.to_string());
                            record.ended_at = Some(now);
                            next.status = RunStatus::Failed;
                            next.last_error = Some(format!("step '{step_key}': {e}"));
                            advance = Advance::Finished(RunStatus::Failed);
                            return Some(Commit {
                                run: next,
                                step: Some(record),
                                transition: None,
                            });
                        }

                        let (target, condition) = match route {
                            Route::Goto { target, condition } => (Some(target.clone()), condition.clone()),
                            Route::Next | Route::FanOut { .. } => (step.next.clone(), None),
                        };
                        record.status = StepStatus::Completed;
                        record.response_payload = output.clone();
                        record.ended_at = Some(now);

                        let mut transition =
                            TransitionRecord::new(next.id, Some(step_key.clone()), target.clone());
                        transition.condition = condition;
                        advance = position_on(&mut next, context, target, &dsl.output_keys);
                        Some(Commit {
                            run: next,
                            step: Some(record),
                            transition: Some(transition),
                        })
                    }
                    StepOutcome::Waiting(wait) => {
                        record.response_payload = wait.request.clone();
                        next.status = RunStatus::Waiting;
                        next.waiting = Some(WaitState {
                            step_key: step_key.clone(),
                            run_step_id: record.id,
                            signal: wait.signal.clone(),
                            fail_on: wait.fail_on.clone(),
                            deadline: wait
                                .timeout_secs
                                .map(|secs| now + chrono::Duration::seconds(secs as i64)),
                            on_deadline: wait.on_deadline,
                        });
                        advance = Advance::Paused;
                        Some(Commit {
                            run: next,
                            step: Some(record),
                            transition: None,
                        })
                    }
                    StepOutcome::Failed(failure) => {
                        record.status = StepStatus::Failed;
                        record.error = Some(failure.reason().to_string());
                        record.ended_at = Some(now);
                        if RetryHandler::should_retry(&policy, budget_attempt, failure) {
                            advance = Advance::Retry {
                                delay: RetryHandler::backoff(&policy, budget_attempt),
                            };
                        } else {
                            next.status = RunStatus::Failed;
                            next.last_error = Some(format!(
                                "step '{step_key}' failed after {budget_attempt} attempt(s): {}",
                                failure.reason()
                            ));
                            advance = Advance::Finished(RunStatus::Failed);
                        }
                        Some(Commit {
                            run: next,
                            step: Some(record),
                            transition: None,
                        })
                    }
                }
            })
            .await?;

        if committed.is_none() {
            tracing::info!(run_id = %run_id, step_key = %step_key, "run moved on during step execution, result discarded");
            let mut skipped = record;
            skipped.status = StepStatus::Skipped;
            skipped.ended_at = Some(Utc::now());
            self.store.save_step(&skipped).await?;
            return Ok(Advance::Abandoned);
        }

        match (&outcome, &advance) {
            (StepOutcome::Completed { .. }, _) => {
                self.events.publish(EngineEvent::StepCompleted {
                    run_id,
                    step_key: step_key.clone(),
                    attempt: record.attempt,
                });
            }
            (StepOutcome::Failed(failure), Advance::Retry { delay }) => {
                tracing::warn!(run_id = %run_id, step_key = %step_key, attempt = record.attempt, ?delay, error = %failure, "step failed, will retry");
                self.publish_failure(run_id, &step_key, record.attempt, failure.reason());
            }
            (StepOutcome::Failed(failure), _) => {
                tracing::error!(run_id = %run_id, step_key = %step_key, attempt = record.attempt, error = %failure, "step failed, retries exhausted");
                self.publish_failure(run_id, &step_key, record.attempt, failure.reason());
            }
            (StepOutcome::Waiting(wait), _) => {
                tracing::debug!(run_id = %run_id, step_key = %step_key, signal = %wait.signal, "run waiting for signal");
            }
        }
        Ok(advance)
    }

    fn publish_failure(&self, run_id: Uuid, step_key: &str, attempt: u32, error: &str) {
        self.events.publish(EngineEvent::StepFailed {
            run_id,
            step_key: step_key.to_string(),
            attempt,
            error: error.to_string(),
        });
    }

    // -----------------------------------------------------------------------
    // Wait resolution
    // -----------------------------------------------------------------------

    /// Resolve the paused step of a Waiting run.
    ///
    /// The awaited signal (or a timer deadline) completes the step: its
    /// payload merges into the context and the run continues at `next`. A
    /// `fail_on` signal or a timeout deadline fails the step and the run.
    pub async fn resolve_wait(
        &self,
        run: WorkflowRun,
        resolution: WaitResolution,
    ) -> Result<Advance, EngineError> {
        let Some(wait) = run.waiting.clone().filter(|_| run.status == RunStatus::Waiting) else {
            return Ok(Advance::Abandoned);
        };
        let dsl = self.load_dsl(&run.definition_code, run.version_number).await?;
        let Some(step) = dsl.step(&wait.step_key).cloned() else {
            return Err(EngineError::InvalidTransition {
                run_id: run.id,
                reason: format!("waiting step '{}' is not in the pinned version", wait.step_key),
            });
        };
        let record = self
            .store
            .list_steps(&run.id)
            .await?
            .into_iter()
            .find(|s| s.id == wait.run_step_id)
            .unwrap_or_else(|| WorkflowRunStep::start(run.id, &wait.step_key, step.step_type, 1));

        // (signal name to apply, payload, failure reason)
        let (applied, payload, failure): (Option<String>, Value, Option<String>) = match &resolution {
            WaitResolution::Signal { name, payload } if *name == wait.signal => {
                (Some(name.clone()), payload.clone(), None)
            }
            WaitResolution::Signal { name, payload } if wait.fail_on.contains(name) => (
                Some(name.clone()),
                payload.clone(),
                Some(format!("received {name} while waiting for {}", wait.signal)),
            ),
            WaitResolution::Signal { .. } => return Ok(Advance::Abandoned),
            WaitResolution::Manual { payload } => (None, payload.clone(), None),
            WaitResolution::DeadlinePassed => match wait.on_deadline {
                DeadlineAction::Signal => (
                    Some(wait.signal.clone()),
                    json!({ "deadline": wait.deadline }),
                    None,
                ),
                DeadlineAction::Fail => (
                    None,
                    Value::Null,
                    Some(format!("timed out waiting for {}", wait.signal)),
                ),
            },
        };

        let run_id = run.id;
        let mut advance = Advance::Abandoned;
        let committed = self
            .commit_with_retry(run, |latest| {
                let still_waiting = latest.status == RunStatus::Waiting
                    && latest.waiting.as_ref().map(|w| w.run_step_id) == Some(wait.run_step_id);
                if !still_waiting {
                    return None;
                }
                let now = Utc::now();
                let mut next = latest.clone();
                let mut record = record.clone();
                let mut context = RunContext::from_value(next.input_context.clone());
                match &applied {
                    Some(name) => context.apply_signal(name, &payload),
                    None => context.merge(&payload),
                }
                next.waiting = None;
                record.ended_at = Some(now);

                if let Some(reason) = &failure {
                    record.status = StepStatus::Failed;
                    record.error = Some(reason.clone());
                    record.response_payload = Some(payload.clone());
                    next.input_context = context.into_value();
                    next.status = RunStatus::Failed;
                    next.last_error = Some(format!("step '{}' failed: {reason}", wait.step_key));
                    advance = Advance::Finished(RunStatus::Failed);
                    return Some(Commit {
                        run: next,
                        step: Some(record),
                        transition: None,
                    });
                }

                record.status = StepStatus::Completed;
                record.response_payload = Some(payload.clone());
                next.status = RunStatus::Running;
                let transition =
                    TransitionRecord::new(next.id, Some(wait.step_key.clone()), step.next.clone());
                advance = position_on(&mut next, context, step.next.clone(), &dsl.output_keys);
                Some(Commit {
                    run: next,
                    step: Some(record),
                    transition: Some(transition),
                })
            })
            .await?;

        if committed.is_none() {
            return Ok(Advance::Abandoned);
        }

        match &failure {
            None => self.events.publish(EngineEvent::StepCompleted {
                run_id,
                step_key: wait.step_key.clone(),
                attempt: record.attempt,
            }),
            Some(reason) => {
                tracing::warn!(run_id = %run_id, step_key = %wait.step_key, reason = %reason, "waiting step failed");
                self.publish_failure(run_id, &wait.step_key, record.attempt, reason);
            }
        }
        Ok(advance)
    }
}

/// Store the context and either move to `target` or complete the run.
fn position_on(
    run: &mut WorkflowRun,
    context: RunContext,
    target: Option<String>,
    output_keys: &[String],
) -> Advance {
    match target {
        Some(target) => {
            run.input_context = context.into_value();
            run.current_step = Some(target);
            Advance::Continue
        }
        None => {
            run.output_context = Some(context.select_output(output_keys));
            run.input_context = context.into_value();
            run.status = RunStatus::Completed;
            run.current_step = None;
            run.ended_at = Some(Utc::now());
            Advance::Finished(RunStatus::Completed)
        }
    }
}

// ---------------------------------------------------------------------------
// Child runs
// ---------------------------------------------------------------------------

/// Launcher handed to one attempt; remembers the children it created.
struct ChildRuns<'a, S> {
    interpreter: &'a Interpreter<S>,
    spawned: Mutex<Vec<Uuid>>,
}

impl<S: WorkflowStore + 'static> ChildRunLauncher for ChildRuns<'_, S> {
    fn launch<'b>(
        &'b self,
        request: ChildRunRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Uuid, StepFailure>> + Send + 'b>> {
        Box::pin(async move {
            match self.interpreter.launch_child(request).await {
                Ok(id) => {
                    if let Ok(mut spawned) = self.spawned.lock() {
                        spawned.push(id);
                    }
                    Ok(id)
                }
                Err(e @ (EngineError::Repository(_) | EngineError::ConcurrencyConflict { .. })) => {
                    Err(StepFailure::Retryable(e.to_string()))
                }
                Err(e) => Err(StepFailure::Fatal(e.to_string())),
            }
        })
    }
}
