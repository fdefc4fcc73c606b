//! In-memory store and recording collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use conductor_types::config::EngineConfig;
use conductor_types::definition::{VersionStatus, WorkflowDefinition, WorkflowDefinitionVersion};
use conductor_types::dsl::{StepConfig, StepSpec, WorkflowDsl};
use conductor_types::error::RepositoryError;
use conductor_types::event::IntegrationEvent;
use conductor_types::idempotency::IdempotencyRecord;
use conductor_types::run::{
    CompensationRecord, RunFilter, RunStatus, SignalRecord, TransitionRecord, WorkflowRun,
    WorkflowRunStep,
};

use crate::gateway::{
    EventPublisher, ExternalCallProxy, GatewayError, HumanTaskGateway, HumanTaskRequest,
    HumanTaskState, ProxyError, PublishError, ServiceCall, ServiceResponse,
};
use crate::repository::{DefinitionRepository, IdempotencyRepository, RunRepository};
use crate::service::hash::BodyHasher;
use crate::workflow::engine::WorkflowEngine;
use crate::workflow::context::RunContext;
use crate::workflow::handler::{
    ChildRunLauncher, ChildRunRequest, NoChildRuns, StepContext, StepFailure,
};
use crate::workflow::interpreter::execution_key;

// ---------------------------------------------------------------------------
// InMemoryStore
// ---------------------------------------------------------------------------

type SlotId = (String, String, String);

#[derive(Default)]
struct State {
    definitions: HashMap<String, WorkflowDefinition>,
    versions: Vec<WorkflowDefinitionVersion>,
    runs: HashMap<Uuid, WorkflowRun>,
    steps: Vec<WorkflowRunStep>,
    signals: Vec<SignalRecord>,
    transitions: Vec<TransitionRecord>,
    compensations: Vec<CompensationRecord>,
    slots: HashMap<SlotId, IdempotencyRecord>,
    /// Commits still to be rejected with a version mismatch.
    forced_mismatches: u32,
}

/// All three repositories over one mutex-guarded state.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

fn slot_id(route: &str, key: &str, body_hash: &str) -> SlotId {
    (route.to_string(), key.to_string(), body_hash.to_string())
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Insert a definition (if missing) and a version carrying `dsl`.
    pub fn seed_version(
        &self,
        code: &str,
        version_number: u32,
        status: VersionStatus,
        dsl: WorkflowDsl,
    ) -> WorkflowDefinitionVersion {
        let now = Utc::now();
        self.with(|state| {
            let definition = state
                .definitions
                .entry(code.to_string())
                .or_insert_with(|| WorkflowDefinition {
                    id: Uuid::now_v7(),
                    code: code.to_string(),
                    name: code.to_string(),
                    description: None,
                    created_at: now,
                    created_by: "tester".to_string(),
                    updated_at: now,
                    updated_by: "tester".to_string(),
                })
                .clone();
            let version = WorkflowDefinitionVersion {
                id: Uuid::now_v7(),
                definition_id: definition.id,
                definition_code: code.to_string(),
                version_number,
                schema_version: dsl.schema_version,
                status,
                dsl,
                changelog: None,
                published_at: (status == VersionStatus::Published).then_some(now),
                created_at: now,
                created_by: "tester".to_string(),
                updated_at: now,
                updated_by: "tester".to_string(),
            };
            state.versions.push(version.clone());
            version
        })
    }

    pub fn run_count(&self) -> usize {
        self.with(|state| state.runs.len())
    }

    pub fn slot_count(&self) -> usize {
        self.with(|state| state.slots.len())
    }

    /// Reject the next `n` calls to `commit_step` as if another writer got there first.
    pub fn fail_next_commits(&self, n: u32) {
        self.with(|state| state.forced_mismatches = n);
    }
}

impl DefinitionRepository for InMemoryStore {
    async fn create_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.with(|state| {
            if state.definitions.contains_key(&def.code) {
                return Err(RepositoryError::Conflict(format!("definition '{}' exists", def.code)));
            }
            state.definitions.insert(def.code.clone(), def.clone());
            Ok(())
        })
    }

    async fn get_definition(&self, code: &str) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.with(|state| state.definitions.get(code).cloned()))
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<_> = self.with(|state| state.definitions.values().cloned().collect());
        defs.sort_by(|a: &WorkflowDefinition, b| a.code.cmp(&b.code));
        Ok(defs)
    }

    async fn create_version(&self, version: &WorkflowDefinitionVersion) -> Result<(), RepositoryError> {
        self.with(|state| {
            let taken = state.versions.iter().any(|v| {
                v.definition_code == version.definition_code
                    && v.version_number == version.version_number
            });
            if taken {
                return Err(RepositoryError::Conflict(format!(
                    "version {} of '{}' exists",
                    version.version_number, version.definition_code
                )));
            }
            state.versions.push(version.clone());
            Ok(())
        })
    }

    async fn update_version(&self, version: &WorkflowDefinitionVersion) -> Result<(), RepositoryError> {
        self.with(|state| {
            let existing = state
                .versions
                .iter_mut()
                .find(|v| v.id == version.id)
                .ok_or(RepositoryError::NotFound)?;
            *existing = version.clone();
            Ok(())
        })
    }

    async fn get_version(
        &self,
        code: &str,
        version_number: u32,
    ) -> Result<Option<WorkflowDefinitionVersion>, RepositoryError> {
        Ok(self.with(|state| {
            state
                .versions
                .iter()
                .find(|v| v.definition_code == code && v.version_number == version_number)
                .cloned()
        }))
    }

    async fn latest_published_version(
        &self,
        code: &str,
    ) -> Result<Option<WorkflowDefinitionVersion>, RepositoryError> {
        Ok(self.with(|state| {
            state
                .versions
                .iter()
                .filter(|v| v.definition_code == code && v.status == VersionStatus::Published)
                .max_by_key(|v| v.version_number)
                .cloned()
        }))
    }

    async fn list_versions(&self, code: &str) -> Result<Vec<WorkflowDefinitionVersion>, RepositoryError> {
        let mut versions: Vec<_> = self.with(|state| {
            state
                .versions
                .iter()
                .filter(|v| v.definition_code == code)
                .cloned()
                .collect()
        });
        versions.sort_by_key(|v: &WorkflowDefinitionVersion| v.version_number);
        Ok(versions)
    }
}

fn check_version(state: &State, run: &WorkflowRun) -> Result<i64, RepositoryError> {
    let stored = state.runs.get(&run.id).ok_or(RepositoryError::NotFound)?;
    if stored.row_version != run.row_version {
        return Err(RepositoryError::VersionMismatch {
            expected: run.row_version,
        });
    }
    Ok(stored.row_version + 1)
}

fn upsert_step(state: &mut State, step: &WorkflowRunStep) {
    match state.steps.iter_mut().find(|s| s.id == step.id) {
        Some(existing) => *existing = step.clone(),
        None => state.steps.push(step.clone()),
    }
}

impl RunRepository for InMemoryStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        self.with(|state| {
            if state.runs.contains_key(&run.id) {
                return Err(RepositoryError::Conflict(format!("run {} exists", run.id)));
            }
            state.runs.insert(run.id, run.clone());
            Ok(())
        })
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.with(|state| state.runs.get(run_id).cloned()))
    }

    async fn update_run(&self, run: &WorkflowRun) -> Result<i64, RepositoryError> {
        self.with(|state| {
            let next = check_version(state, run)?;
            let mut stored = run.clone();
            stored.row_version = next;
            state.runs.insert(run.id, stored);
            Ok(next)
        })
    }

    async fn commit_step(
        &self,
        run: &WorkflowRun,
        step: Option<&WorkflowRunStep>,
        transition: Option<&TransitionRecord>,
    ) -> Result<i64, RepositoryError> {
        self.with(|state| {
            if state.forced_mismatches > 0 {
                state.forced_mismatches -= 1;
                return Err(RepositoryError::VersionMismatch {
                    expected: run.row_version,
                });
            }
            let next = check_version(state, run)?;
            let mut stored = run.clone();
            stored.row_version = next;
            state.runs.insert(run.id, stored);
            if let Some(step) = step {
                upsert_step(state, step);
            }
            if let Some(transition) = transition {
                state.transitions.push(transition.clone());
            }
            Ok(next)
        })
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut runs: Vec<WorkflowRun> = self.with(|state| {
            state
                .runs
                .values()
                .filter(|r| {
                    filter
                        .definition_code
                        .as_ref()
                        .is_none_or(|code| &r.definition_code == code)
                        && filter.status.is_none_or(|status| r.status == status)
                        && filter
                            .correlation_id
                            .as_ref()
                            .is_none_or(|c| r.correlation_id.as_ref() == Some(c))
                })
                .cloned()
                .collect()
        });
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            runs.truncate(limit as usize);
        }
        Ok(runs)
    }

    async fn find_by_correlation(&self, correlation_id: &str) -> Result<Vec<WorkflowRun>, RepositoryError> {
        self.list_runs(&RunFilter {
            correlation_id: Some(correlation_id.to_string()),
            ..RunFilter::default()
        })
        .await
    }

    async fn count_runs_for_version(&self, code: &str, version_number: u32) -> Result<u64, RepositoryError> {
        Ok(self.with(|state| {
            state
                .runs
                .values()
                .filter(|r| r.definition_code == code && r.version_number == version_number)
                .count() as u64
        }))
    }

    async fn due_waits(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<WorkflowRun>, RepositoryError> {
        Ok(self.with(|state| {
            state
                .runs
                .values()
                .filter(|r| {
                    r.status == RunStatus::Waiting
                        && r.waiting
                            .as_ref()
                            .and_then(|w| w.deadline)
                            .is_some_and(|deadline| deadline <= now)
                })
                .take(limit as usize)
                .cloned()
                .collect()
        }))
    }

    async fn runs_idle_since(
        &self,
        status: RunStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        Ok(self.with(|state| {
            state
                .runs
                .values()
                .filter(|r| r.status == status && r.updated_at < before)
                .take(limit as usize)
                .cloned()
                .collect()
        }))
    }

    async fn save_step(&self, step: &WorkflowRunStep) -> Result<(), RepositoryError> {
        self.with(|state| upsert_step(state, step));
        Ok(())
    }

    async fn list_steps(&self, run_id: &Uuid) -> Result<Vec<WorkflowRunStep>, RepositoryError> {
        Ok(self.with(|state| {
            state
                .steps
                .iter()
                .filter(|s| s.run_id == *run_id)
                .cloned()
                .collect()
        }))
    }

    async fn record_signal(&self, signal: &SignalRecord) -> Result<(), RepositoryError> {
        self.with(|state| state.signals.push(signal.clone()));
        Ok(())
    }

    async fn list_signals(&self, run_id: &Uuid) -> Result<Vec<SignalRecord>, RepositoryError> {
        Ok(self.with(|state| {
            state
                .signals
                .iter()
                .filter(|s| s.run_id == *run_id)
                .cloned()
                .collect()
        }))
    }

    async fn list_transitions(&self, run_id: &Uuid) -> Result<Vec<TransitionRecord>, RepositoryError> {
        Ok(self.with(|state| {
            state
                .transitions
                .iter()
                .filter(|t| t.run_id == *run_id)
                .cloned()
                .collect()
        }))
    }

    async fn record_compensation(&self, record: &CompensationRecord) -> Result<bool, RepositoryError> {
        Ok(self.with(|state| {
            let exists = state.compensations.iter().any(|c| {
                c.run_step_id == record.run_step_id && c.action_index == record.action_index
            });
            if !exists {
                state.compensations.push(record.clone());
            }
            !exists
        }))
    }

    async fn list_compensations(&self, run_id: &Uuid) -> Result<Vec<CompensationRecord>, RepositoryError> {
        Ok(self.with(|state| {
            state
                .compensations
                .iter()
                .filter(|c| c.run_id == *run_id)
                .cloned()
                .collect()
        }))
    }
}

impl IdempotencyRepository for InMemoryStore {
    async fn try_reserve(
        &self,
        route: &str,
        key: &str,
        body_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        Ok(self.with(|state| {
            let id = slot_id(route, key, body_hash);
            if state.slots.contains_key(&id) {
                return false;
            }
            state.slots.insert(
                id,
                IdempotencyRecord {
                    route: route.to_string(),
                    key: key.to_string(),
                    body_hash: body_hash.to_string(),
                    response: None,
                    status_code: None,
                    reserved_at: now,
                    completed_at: None,
                },
            );
            true
        }))
    }

    async fn get_slot(
        &self,
        route: &str,
        key: &str,
        body_hash: &str,
    ) -> Result<Option<IdempotencyRecord>, RepositoryError> {
        Ok(self.with(|state| state.slots.get(&slot_id(route, key, body_hash)).cloned()))
    }

    async fn take_over(
        &self,
        route: &str,
        key: &str,
        body_hash: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        Ok(self.with(|state| match state.slots.get_mut(&slot_id(route, key, body_hash)) {
            Some(slot) if slot.response.is_none() && slot.reserved_at < stale_before => {
                slot.reserved_at = now;
                true
            }
            _ => false,
        }))
    }

    async fn complete_slot(
        &self,
        route: &str,
        key: &str,
        body_hash: &str,
        response: &Value,
        status_code: u16,
    ) -> Result<(), RepositoryError> {
        self.with(|state| {
            let slot = state
                .slots
                .get_mut(&slot_id(route, key, body_hash))
                .ok_or(RepositoryError::NotFound)?;
            slot.response = Some(response.clone());
            slot.status_code = Some(status_code);
            slot.completed_at = Some(Utc::now());
            Ok(())
        })
    }

    async fn release_slot(&self, route: &str, key: &str, body_hash: &str) -> Result<(), RepositoryError> {
        self.with(|state| {
            let id = slot_id(route, key, body_hash);
            if state.slots.get(&id).is_some_and(|s| s.response.is_none()) {
                state.slots.remove(&id);
            }
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recording collaborators
// ---------------------------------------------------------------------------

/// Proxy answering from per-method queues. Unscripted calls succeed with `{}`.
#[derive(Default)]
pub struct RecordingProxy {
    calls: Mutex<Vec<ServiceCall>>,
    responses: Mutex<HashMap<String, VecDeque<Result<ServiceResponse, ProxyError>>>>,
}

impl RecordingProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the answer to the next call of `method_id`.
    pub fn respond(&self, method_id: &str, response: Result<ServiceResponse, ProxyError>) {
        self.responses
            .lock()
            .unwrap()
            .entry(method_id.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method_id: &str) -> Vec<ServiceCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method_id == method_id)
            .collect()
    }

    /// Method ids in call order.
    pub fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.method_id).collect()
    }
}

impl ExternalCallProxy for RecordingProxy {
    async fn invoke(&self, call: &ServiceCall) -> Result<ServiceResponse, ProxyError> {
        self.calls.lock().unwrap().push(call.clone());
        self.responses
            .lock()
            .unwrap()
            .get_mut(&call.method_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Ok(ServiceResponse::ok(json!({}))))
    }
}

/// Gateway issuing sequential task ids (`task-1`, `task-2`, ...).
#[derive(Default)]
pub struct RecordingGateway {
    requests: Mutex<Vec<HumanTaskRequest>>,
    failures: Mutex<VecDeque<GatewayError>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: GatewayError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn requests(&self) -> Vec<HumanTaskRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HumanTaskGateway for RecordingGateway {
    async fn create_task(&self, request: &HumanTaskRequest) -> Result<String, GatewayError> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        Ok(format!("task-{}", requests.len()))
    }

    async fn task_state(&self, task_id: &str) -> Result<HumanTaskState, GatewayError> {
        let count = self.requests.lock().unwrap().len();
        let known = task_id
            .strip_prefix("task-")
            .and_then(|n| n.parse::<usize>().ok())
            .is_some_and(|n| (1..=count).contains(&n));
        if known {
            Ok(HumanTaskState::Open)
        } else {
            Err(GatewayError::NotFound(task_id.to_string()))
        }
    }
}

/// Publisher keeping every event it was handed.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<IntegrationEvent>>,
    failures: Mutex<VecDeque<PublishError>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: PublishError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn events(&self) -> Vec<IntegrationEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.events().iter().map(|e| e.name().to_string()).collect()
    }
}

impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: IntegrationEvent) -> Result<(), PublishError> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Launcher that records requests and hands out fresh ids.
#[derive(Default)]
pub struct RecordingLauncher {
    requests: Mutex<Vec<ChildRunRequest>>,
    launched: Mutex<Vec<Uuid>>,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ChildRunRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn launched(&self) -> Vec<Uuid> {
        self.launched.lock().unwrap().clone()
    }
}

impl ChildRunLauncher for RecordingLauncher {
    fn launch<'a>(
        &'a self,
        request: ChildRunRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Uuid, StepFailure>> + Send + 'a>> {
        Box::pin(async move {
            let id = Uuid::now_v7();
            self.requests.lock().unwrap().push(request);
            self.launched.lock().unwrap().push(id);
            Ok(id)
        })
    }
}

// ---------------------------------------------------------------------------
// TestStep
// ---------------------------------------------------------------------------

/// A single step (id `step`) on a Running run, for exercising handlers directly.
pub struct TestStep {
    pub run: WorkflowRun,
    pub step: StepSpec,
    pub context: RunContext,
    pub execution_key: String,
}

impl TestStep {
    pub fn new(config: StepConfig, context: Value) -> Self {
        let mut run = WorkflowRun::new("Test", 1, context.clone(), None, "tester");
        run.status = RunStatus::Running;
        run.current_step = Some("step".to_string());
        Self {
            execution_key: execution_key(run.id, "step", 1),
            run,
            step: StepSpec::new("step", config),
            context: RunContext::from_value(context),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.step.timeout_secs = Some(secs);
        self
    }

    pub fn ctx(&self) -> StepContext<'_> {
        self.ctx_with_children(&NoChildRuns)
    }

    pub fn ctx_with_children<'a>(&'a self, children: &'a dyn ChildRunLauncher) -> StepContext<'a> {
        StepContext {
            run: &self.run,
            step: &self.step,
            attempt: 1,
            execution_key: &self.execution_key,
            context: &self.context,
            children,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

/// Uses the canonical JSON itself as the hash.
pub struct PlainHasher;

impl BodyHasher for PlainHasher {
    fn compute_hash(&self, content: &str) -> String {
        content.to_string()
    }
}

/// Inline compensation, no backoff, fast idempotency polling.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.default_retry_backoff_ms = 0;
    config.compensation.background = false;
    config.idempotency.poll_interval_ms = 5;
    config.idempotency.poll_timeout_ms = 2_000;
    config
}

/// A standard engine over an in-memory store and recording collaborators.
pub struct EngineHarness {
    pub engine: WorkflowEngine<InMemoryStore>,
    pub store: Arc<InMemoryStore>,
    pub proxy: Arc<RecordingProxy>,
    pub gateway: Arc<RecordingGateway>,
    pub publisher: Arc<RecordingPublisher>,
}

impl EngineHarness {
    pub fn new(config: EngineConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let proxy = Arc::new(RecordingProxy::new());
        let gateway = Arc::new(RecordingGateway::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let engine = WorkflowEngine::standard(
            store.clone(),
            proxy.clone(),
            gateway.clone(),
            publisher.clone(),
            Arc::new(PlainHasher),
            config,
        );
        Self {
            engine,
            store,
            proxy,
            gateway,
            publisher,
        }
    }
}
