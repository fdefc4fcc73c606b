//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time. `DatabasePool` keeps a
//! multi-connection reader pool for concurrent reads and a single-connection
//! writer pool for serialized writes. Both use WAL journal mode and enforce
//! foreign keys.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Split read/write pool for SQLite with WAL mode.
///
/// - `reader`: multi-connection pool (up to 8) for concurrent SELECT queries.
/// - `writer`: single-connection pool for serialized INSERT/UPDATE/DELETE.
///   Version-checked run writes rely on this serialization.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if missing) the database and run migrations on the writer.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);
        let write_opts = base_opts;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_opts)
            .await?;

        // Migrate before the reader pool opens the file read-only.
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        Ok(Self { reader, writer })
    }
}

/// `sqlite://{data_dir}/conductor.db`.
pub fn database_url(data_dir: &Path) -> String {
    format!("sqlite://{}/conductor.db", data_dir.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_pool() -> (tempfile::TempDir, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn test_pool_creates_tables() {
        let (_dir, pool) = temp_pool().await;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();

        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        for table in [
            "compensation_log",
            "idempotency_keys",
            "workflow_definition_versions",
            "workflow_definitions",
            "workflow_run_steps",
            "workflow_runs",
            "workflow_signals",
            "workflow_transitions",
        ] {
            assert!(names.contains(&table), "{table} table missing");
        }
    }

    #[tokio::test]
    async fn test_pool_wal_and_foreign_keys() {
        let (_dir, pool) = temp_pool().await;

        let mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(mode.0.to_lowercase(), "wal");

        let fk: (i32,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(fk.0, 1, "foreign keys should be enabled");
    }

    #[test]
    fn test_database_url() {
        let url = database_url(Path::new("/var/lib/conductor"));
        assert_eq!(url, "sqlite:///var/lib/conductor/conductor.db");
    }
}
