//! SQLite `RunRepository` implementation.
//!
//! The run row is written with `WHERE id = ? AND row_version = ?` and bumps
//! `row_version` in the same statement. `commit_step` wraps the run write,
//! the step upsert and the transition insert in one transaction on the
//! writer connection.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use conductor_core::repository::RunRepository;
use conductor_types::error::RepositoryError;
use conductor_types::run::{
    CompensationRecord, RunFilter, RunStatus, SignalRecord, TransitionRecord, WaitState,
    WorkflowRun, WorkflowRunStep,
};

use super::{
    SqliteWorkflowStore, db_err, format_datetime, from_json, parse_datetime, parse_enum,
    parse_uuid, to_json,
};

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn opt_datetime(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    let value: Option<String> = row.try_get(column).map_err(db_err)?;
    value.as_deref().map(parse_datetime).transpose()
}

fn datetime(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, RepositoryError> {
    let value: String = row.try_get(column).map_err(db_err)?;
    parse_datetime(&value)
}

fn opt_json(row: &SqliteRow, column: &str) -> Result<Option<serde_json::Value>, RepositoryError> {
    let value: Option<String> = row.try_get(column).map_err(db_err)?;
    value.as_deref().map(|s| from_json(s, column)).transpose()
}

fn run_from_row(row: &SqliteRow) -> Result<WorkflowRun, RepositoryError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let input_context: String = row.try_get("input_context").map_err(db_err)?;
    let parent_run_id: Option<String> = row.try_get("parent_run_id").map_err(db_err)?;
    let waiting: Option<String> = row.try_get("waiting").map_err(db_err)?;
    let version_number: i64 = row.try_get("version_number").map_err(db_err)?;

    Ok(WorkflowRun {
        id: parse_uuid(&id)?,
        definition_code: row.try_get("definition_code").map_err(db_err)?,
        version_number: version_number as u32,
        status: parse_enum(&status)?,
        input_context: from_json(&input_context, "input_context")?,
        output_context: opt_json(row, "output_context")?,
        correlation_id: row.try_get("correlation_id").map_err(db_err)?,
        initiated_by: row.try_get("initiated_by").map_err(db_err)?,
        parent_run_id: parent_run_id.as_deref().map(parse_uuid).transpose()?,
        current_step: row.try_get("current_step").map_err(db_err)?,
        waiting: waiting
            .as_deref()
            .map(|s| from_json::<WaitState>(s, "waiting"))
            .transpose()?,
        last_error: row.try_get("last_error").map_err(db_err)?,
        row_version: row.try_get("row_version").map_err(db_err)?,
        started_at: opt_datetime(row, "started_at")?,
        ended_at: opt_datetime(row, "ended_at")?,
        created_at: datetime(row, "created_at")?,
        updated_at: datetime(row, "updated_at")?,
    })
}

fn step_from_row(row: &SqliteRow) -> Result<WorkflowRunStep, RepositoryError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let run_id: String = row.try_get("run_id").map_err(db_err)?;
    let step_type: String = row.try_get("step_type").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let attempt: i64 = row.try_get("attempt").map_err(db_err)?;

    Ok(WorkflowRunStep {
        id: parse_uuid(&id)?,
        run_id: parse_uuid(&run_id)?,
        step_key: row.try_get("step_key").map_err(db_err)?,
        step_type: parse_enum(&step_type)?,
        status: parse_enum(&status)?,
        attempt: attempt as u32,
        request_payload: opt_json(row, "request_payload")?,
        response_payload: opt_json(row, "response_payload")?,
        error: row.try_get("error").map_err(db_err)?,
        idempotency_key: row.try_get("idempotency_key").map_err(db_err)?,
        started_at: datetime(row, "started_at")?,
        ended_at: opt_datetime(row, "ended_at")?,
    })
}

fn signal_from_row(row: &SqliteRow) -> Result<SignalRecord, RepositoryError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let run_id: String = row.try_get("run_id").map_err(db_err)?;
    let payload: String = row.try_get("payload").map_err(db_err)?;
    let disposition: String = row.try_get("disposition").map_err(db_err)?;
    Ok(SignalRecord {
        id: parse_uuid(&id)?,
        run_id: parse_uuid(&run_id)?,
        name: row.try_get("name").map_err(db_err)?,
        payload: from_json(&payload, "signal payload")?,
        disposition: parse_enum(&disposition)?,
        received_at: datetime(row, "received_at")?,
    })
}

fn transition_from_row(row: &SqliteRow) -> Result<TransitionRecord, RepositoryError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let run_id: String = row.try_get("run_id").map_err(db_err)?;
    Ok(TransitionRecord {
        id: parse_uuid(&id)?,
        run_id: parse_uuid(&run_id)?,
        from_step: row.try_get("from_step").map_err(db_err)?,
        to_step: row.try_get("to_step").map_err(db_err)?,
        condition: row.try_get("condition").map_err(db_err)?,
        created_at: datetime(row, "created_at")?,
    })
}

fn compensation_from_row(row: &SqliteRow) -> Result<CompensationRecord, RepositoryError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let run_id: String = row.try_get("run_id").map_err(db_err)?;
    let run_step_id: String = row.try_get("run_step_id").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let action_index: i64 = row.try_get("action_index").map_err(db_err)?;
    let attempts: i64 = row.try_get("attempts").map_err(db_err)?;
    Ok(CompensationRecord {
        id: parse_uuid(&id)?,
        run_id: parse_uuid(&run_id)?,
        run_step_id: parse_uuid(&run_step_id)?,
        step_key: row.try_get("step_key").map_err(db_err)?,
        action_index: action_index as u32,
        kind: row.try_get("kind").map_err(db_err)?,
        status: parse_enum(&status)?,
        attempts: attempts as u32,
        error: row.try_get("error").map_err(db_err)?,
        executed_at: datetime(row, "executed_at")?,
    })
}

// ---------------------------------------------------------------------------
// Writes shared by update_run and commit_step
// ---------------------------------------------------------------------------

/// Version-checked run write. Returns the new stamp.
async fn write_run(conn: &mut SqliteConnection, run: &WorkflowRun) -> Result<i64, RepositoryError> {
    let output_context = run.output_context.as_ref().map(to_json).transpose()?;
    let waiting = run.waiting.as_ref().map(to_json).transpose()?;
    let wait_deadline = run
        .waiting
        .as_ref()
        .and_then(|w| w.deadline.as_ref())
        .map(format_datetime);

    let result = sqlx::query(
        r#"UPDATE workflow_runs
           SET status = ?, input_context = ?, output_context = ?, correlation_id = ?,
               current_step = ?, waiting = ?, wait_deadline = ?, last_error = ?,
               started_at = ?, ended_at = ?, updated_at = ?,
               row_version = row_version + 1
           WHERE id = ? AND row_version = ?"#,
    )
    .bind(run.status.as_str())
    .bind(to_json(&run.input_context)?)
    .bind(&output_context)
    .bind(&run.correlation_id)
    .bind(&run.current_step)
    .bind(&waiting)
    .bind(&wait_deadline)
    .bind(&run.last_error)
    .bind(run.started_at.as_ref().map(format_datetime))
    .bind(run.ended_at.as_ref().map(format_datetime))
    .bind(format_datetime(&run.updated_at))
    .bind(run.id.to_string())
    .bind(run.row_version)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    if result.rows_affected() == 0 {
        let exists = sqlx::query("SELECT 1 FROM workflow_runs WHERE id = ?")
            .bind(run.id.to_string())
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;
        return Err(match exists {
            Some(_) => RepositoryError::VersionMismatch {
                expected: run.row_version,
            },
            None => RepositoryError::NotFound,
        });
    }
    Ok(run.row_version + 1)
}

async fn upsert_step(conn: &mut SqliteConnection, step: &WorkflowRunStep) -> Result<(), RepositoryError> {
    let request = step.request_payload.as_ref().map(to_json).transpose()?;
    let response = step.response_payload.as_ref().map(to_json).transpose()?;

    sqlx::query(
        r#"INSERT INTO workflow_run_steps
           (id, run_id, step_key, step_type, status, attempt, request_payload,
            response_payload, error, idempotency_key, started_at, ended_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET
             status = excluded.status,
             request_payload = excluded.request_payload,
             response_payload = excluded.response_payload,
             error = excluded.error,
             idempotency_key = excluded.idempotency_key,
             ended_at = excluded.ended_at"#,
    )
    .bind(step.id.to_string())
    .bind(step.run_id.to_string())
    .bind(&step.step_key)
    .bind(step.step_type.as_str())
    .bind(step.status.as_str())
    .bind(step.attempt as i64)
    .bind(&request)
    .bind(&response)
    .bind(&step.error)
    .bind(&step.idempotency_key)
    .bind(format_datetime(&step.started_at))
    .bind(step.ended_at.as_ref().map(format_datetime))
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn insert_transition(
    conn: &mut SqliteConnection,
    transition: &TransitionRecord,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO workflow_transitions (id, run_id, from_step, to_step, condition, created_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(transition.id.to_string())
    .bind(transition.run_id.to_string())
    .bind(&transition.from_step)
    .bind(&transition.to_step)
    .bind(&transition.condition)
    .bind(format_datetime(&transition.created_at))
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteWorkflowStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let output_context = run.output_context.as_ref().map(to_json).transpose()?;
        let waiting = run.waiting.as_ref().map(to_json).transpose()?;
        let wait_deadline = run
            .waiting
            .as_ref()
            .and_then(|w| w.deadline.as_ref())
            .map(format_datetime);

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, definition_code, version_number, status, input_context, output_context,
                correlation_id, initiated_by, parent_run_id, current_step, waiting, wait_deadline,
                last_error, row_version, started_at, ended_at, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.definition_code)
        .bind(run.version_number as i64)
        .bind(run.status.as_str())
        .bind(to_json(&run.input_context)?)
        .bind(&output_context)
        .bind(&run.correlation_id)
        .bind(&run.initiated_by)
        .bind(run.parent_run_id.map(|id| id.to_string()))
        .bind(&run.current_step)
        .bind(&waiting)
        .bind(&wait_deadline)
        .bind(&run.last_error)
        .bind(run.row_version)
        .bind(run.started_at.as_ref().map(format_datetime))
        .bind(run.ended_at.as_ref().map(format_datetime))
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn update_run(&self, run: &WorkflowRun) -> Result<i64, RepositoryError> {
        let mut conn = self.pool.writer.acquire().await.map_err(db_err)?;
        write_run(&mut *conn, run).await
    }

    async fn commit_step(
        &self,
        run: &WorkflowRun,
        step: Option<&WorkflowRunStep>,
        transition: Option<&TransitionRecord>,
    ) -> Result<i64, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;
        // Dropping the transaction on error rolls everything back.
        let next = write_run(&mut *tx, run).await?;
        if let Some(step) = step {
            upsert_step(&mut *tx, step).await?;
        }
        if let Some(transition) = transition {
            insert_transition(&mut *tx, transition).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(next)
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut sql = String::from("SELECT * FROM workflow_runs WHERE 1 = 1");
        if filter.definition_code.is_some() {
            sql.push_str(" AND definition_code = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.correlation_id.is_some() {
            sql.push_str(" AND correlation_id = ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(code) = &filter.definition_code {
            query = query.bind(code);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(correlation_id) = &filter.correlation_id {
            query = query.bind(correlation_id);
        }
        // SQLite treats a negative LIMIT as no limit.
        let limit = filter.limit.map(i64::from).unwrap_or(-1);

        let rows = query
            .bind(limit)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;
        rows.iter().map(run_from_row).collect()
    }

    async fn find_by_correlation(&self, correlation_id: &str) -> Result<Vec<WorkflowRun>, RepositoryError> {
        self.list_runs(&RunFilter {
            correlation_id: Some(correlation_id.to_string()),
            ..RunFilter::default()
        })
        .await
    }

    async fn count_runs_for_version(&self, code: &str, version_number: u32) -> Result<u64, RepositoryError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM workflow_runs WHERE definition_code = ? AND version_number = ?",
        )
        .bind(code)
        .bind(version_number as i64)
        .fetch_one(&self.pool.reader)
        .await
        .map_err(db_err)?;
        Ok(count as u64)
    }

    async fn due_waits(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_runs
               WHERE status = 'waiting' AND wait_deadline IS NOT NULL AND wait_deadline <= ?
               ORDER BY wait_deadline ASC LIMIT ?"#,
        )
        .bind(format_datetime(&now))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        rows.iter().map(run_from_row).collect()
    }

    async fn runs_idle_since(
        &self,
        status: RunStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_runs
               WHERE status = ? AND updated_at < ?
               ORDER BY updated_at ASC LIMIT ?"#,
        )
        .bind(status.as_str())
        .bind(format_datetime(&before))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        rows.iter().map(run_from_row).collect()
    }

    async fn save_step(&self, step: &WorkflowRunStep) -> Result<(), RepositoryError> {
        let mut conn = self.pool.writer.acquire().await.map_err(db_err)?;
        upsert_step(&mut *conn, step).await
    }

    async fn list_steps(&self, run_id: &Uuid) -> Result<Vec<WorkflowRunStep>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_run_steps WHERE run_id = ? ORDER BY started_at ASC, id ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        rows.iter().map(step_from_row).collect()
    }

    async fn record_signal(&self, signal: &SignalRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_signals (id, run_id, name, payload, disposition, received_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(signal.id.to_string())
        .bind(signal.run_id.to_string())
        .bind(&signal.name)
        .bind(to_json(&signal.payload)?)
        .bind(signal.disposition.as_str())
        .bind(format_datetime(&signal.received_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_signals(&self, run_id: &Uuid) -> Result<Vec<SignalRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_signals WHERE run_id = ? ORDER BY received_at ASC, id ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        rows.iter().map(signal_from_row).collect()
    }

    async fn list_transitions(&self, run_id: &Uuid) -> Result<Vec<TransitionRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_transitions WHERE run_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        rows.iter().map(transition_from_row).collect()
    }

    async fn record_compensation(&self, record: &CompensationRecord) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO compensation_log
               (id, run_id, run_step_id, step_key, action_index, kind, status, attempts, error, executed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_step_id, action_index) DO NOTHING"#,
        )
        .bind(record.id.to_string())
        .bind(record.run_id.to_string())
        .bind(record.run_step_id.to_string())
        .bind(&record.step_key)
        .bind(record.action_index as i64)
        .bind(&record.kind)
        .bind(record.status.as_str())
        .bind(record.attempts as i64)
        .bind(&record.error)
        .bind(format_datetime(&record.executed_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_compensations(&self, run_id: &Uuid) -> Result<Vec<CompensationRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM compensation_log WHERE run_id = ? ORDER BY executed_at ASC, id ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        rows.iter().map(compensation_from_row).collect()
    }
}
