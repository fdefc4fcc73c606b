//! SQLite `IdempotencyRepository` implementation.
//!
//! The (route, key, body_hash) primary key provides the atomic
//! insert-if-absent: `INSERT ... ON CONFLICT DO NOTHING` reports through
//! `rows_affected` whether this caller created the slot.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;

use conductor_core::repository::IdempotencyRepository;
use conductor_types::error::RepositoryError;
use conductor_types::idempotency::IdempotencyRecord;

use super::{SqliteWorkflowStore, db_err, format_datetime, from_json, parse_datetime, to_json};

impl IdempotencyRepository for SqliteWorkflowStore {
    async fn try_reserve(
        &self,
        route: &str,
        key: &str,
        body_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO idempotency_keys (route, key, body_hash, reserved_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(route, key, body_hash) DO NOTHING"#,
        )
        .bind(route)
        .bind(key)
        .bind(body_hash)
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_slot(
        &self,
        route: &str,
        key: &str,
        body_hash: &str,
    ) -> Result<Option<IdempotencyRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM idempotency_keys WHERE route = ? AND key = ? AND body_hash = ?",
        )
        .bind(route)
        .bind(key)
        .bind(body_hash)
        // Read on the writer: a duplicate polls for a response written moments ago.
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let response: Option<String> = row.try_get("response").map_err(db_err)?;
        let status_code: Option<i64> = row.try_get("status_code").map_err(db_err)?;
        let reserved_at: String = row.try_get("reserved_at").map_err(db_err)?;
        let completed_at: Option<String> = row.try_get("completed_at").map_err(db_err)?;

        Ok(Some(IdempotencyRecord {
            route: row.try_get("route").map_err(db_err)?,
            key: row.try_get("key").map_err(db_err)?,
            body_hash: row.try_get("body_hash").map_err(db_err)?,
            response: response.as_deref().map(|s| from_json(s, "response")).transpose()?,
            status_code: status_code.map(|c| c as u16),
            reserved_at: parse_datetime(&reserved_at)?,
            completed_at: completed_at.as_deref().map(parse_datetime).transpose()?,
        }))
    }

    async fn take_over(
        &self,
        route: &str,
        key: &str,
        body_hash: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE idempotency_keys SET reserved_at = ?
               WHERE route = ? AND key = ? AND body_hash = ?
                 AND response IS NULL AND reserved_at < ?"#,
        )
        .bind(format_datetime(&now))
        .bind(route)
        .bind(key)
        .bind(body_hash)
        .bind(format_datetime(&stale_before))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_slot(
        &self,
        route: &str,
        key: &str,
        body_hash: &str,
        response: &Value,
        status_code: u16,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE idempotency_keys SET response = ?, status_code = ?, completed_at = ?
               WHERE route = ? AND key = ? AND body_hash = ?"#,
        )
        .bind(to_json(response)?)
        .bind(status_code as i64)
        .bind(format_datetime(&Utc::now()))
        .bind(route)
        .bind(key)
        .bind(body_hash)
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn release_slot(&self, route: &str, key: &str, body_hash: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"DELETE FROM idempotency_keys
               WHERE route = ? AND key = ? AND body_hash = ? AND response IS NULL"#,
        )
        .bind(route)
        .bind(key)
        .bind(body_hash)
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::sqlite::test_support::temp_store;

    const ROUTE: &str = "workflow.start";

    #[tokio::test]
    async fn test_reserve_is_insert_if_absent() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();
        assert!(store.try_reserve(ROUTE, "k1", "h1", now).await.unwrap());
        assert!(!store.try_reserve(ROUTE, "k1", "h1", now).await.unwrap());
        // A different body is a different slot.
        assert!(store.try_reserve(ROUTE, "k1", "h2", now).await.unwrap());

        let slot = store.get_slot(ROUTE, "k1", "h1").await.unwrap().unwrap();
        assert!(!slot.is_answered());
    }

    #[tokio::test]
    async fn test_complete_then_release_keeps_response() {
        let (_dir, store) = temp_store().await;
        store.try_reserve(ROUTE, "k1", "h1", Utc::now()).await.unwrap();
        store
            .complete_slot(ROUTE, "k1", "h1", &json!({ "run_id": "r-1" }), 201)
            .await
            .unwrap();

        // Releasing an answered slot is a no-op.
        store.release_slot(ROUTE, "k1", "h1").await.unwrap();
        let slot = store.get_slot(ROUTE, "k1", "h1").await.unwrap().unwrap();
        assert_eq!(slot.response, Some(json!({ "run_id": "r-1" })));
        assert_eq!(slot.status_code, Some(201));
        assert!(slot.completed_at.is_some());

        let err = store
            .complete_slot(ROUTE, "missing", "h1", &json!({}), 201)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_take_over_only_stale_unanswered_slots() {
        let (_dir, store) = temp_store().await;
        let reserved = Utc::now() - chrono::Duration::seconds(600);
        store.try_reserve(ROUTE, "k1", "h1", reserved).await.unwrap();

        let now = Utc::now();
        let fresh_cutoff = reserved - chrono::Duration::seconds(1);
        assert!(!store.take_over(ROUTE, "k1", "h1", fresh_cutoff, now).await.unwrap());
        assert!(store.take_over(ROUTE, "k1", "h1", now, now).await.unwrap());

        store.release_slot(ROUTE, "k1", "h1").await.unwrap();
        assert!(store.get_slot(ROUTE, "k1", "h1").await.unwrap().is_none());
    }
}
