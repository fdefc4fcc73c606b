//! Run state store trait.
//!
//! Every run-row write is version-stamped: the caller passes the run as it
//! last read it, and the store rejects the write with
//! `RepositoryError::VersionMismatch` when `row_version` no longer matches.
//! Successful writes return the new stamp.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use conductor_types::error::RepositoryError;
use conductor_types::run::{
    CompensationRecord, RunFilter, RunStatus, SignalRecord, TransitionRecord, WorkflowRun,
    WorkflowRunStep,
};

pub trait RunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Version-checked write of the whole run row.
    fn update_run(
        &self,
        run: &WorkflowRun,
    ) -> impl Future<Output = Result<i64, RepositoryError>> + Send;

    /// Atomically write the run row (version-checked), upsert an optional
    /// step record, and append an optional transition. Nothing is written
    /// on mismatch.
    fn commit_step(
        &self,
        run: &WorkflowRun,
        step: Option<&WorkflowRunStep>,
        transition: Option<&TransitionRecord>,
    ) -> impl Future<Output = Result<i64, RepositoryError>> + Send;

    fn list_runs(
        &self,
        filter: &RunFilter,
    ) -> impl Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Runs carrying a correlation id, newest first.
    fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> impl Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Number of runs pinned to a definition version.
    fn count_runs_for_version(
        &self,
        code: &str,
        version_number: u32,
    ) -> impl Future<Output = Result<u64, RepositoryError>> + Send;

    /// Waiting runs whose wait deadline is at or before `now`.
    fn due_waits(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Runs in `status` last written before `before`.
    fn runs_idle_since(
        &self,
        status: RunStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Insert or replace a step record by id.
    fn save_step(
        &self,
        step: &WorkflowRunStep,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// All step records of a run in start order.
    fn list_steps(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<WorkflowRunStep>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    fn record_signal(
        &self,
        signal: &SignalRecord,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn list_signals(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<SignalRecord>, RepositoryError>> + Send;

    fn list_transitions(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<TransitionRecord>, RepositoryError>> + Send;

    /// Insert a compensation record unless one exists for the same
    /// (run step, action index). Returns `true` when inserted.
    fn record_compensation(
        &self,
        record: &CompensationRecord,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    fn list_compensations(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<CompensationRecord>, RepositoryError>> + Send;
}
