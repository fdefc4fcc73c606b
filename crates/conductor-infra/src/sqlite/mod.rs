//! SQLite storage layer.
//!
//! `SqliteWorkflowStore` implements every repository trait from
//! `conductor-core` over one split read/write pool, so it satisfies
//! `WorkflowStore` through the blanket impl.

pub mod definition;
pub mod idempotency;
pub mod pool;
pub mod run;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use conductor_types::error::RepositoryError;

use self::pool::DatabasePool;

/// SQLite-backed store for definitions, runs, audit records and idempotency slots.
#[derive(Clone)]
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by the repository impls
// ---------------------------------------------------------------------------

/// Unique-constraint violations become `Conflict`; everything else is a query error.
pub(crate) fn db_err(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => RepositoryError::Connection,
        _ => RepositoryError::Query(e.to_string()),
    }
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC form, so text comparison in SQL orders chronologically.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

pub(crate) fn from_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

pub(crate) fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, RepositoryError> {
    s.parse::<T>().map_err(RepositoryError::Query)
}



#[cfg(test)]
mod scenarios;
