//! SQLite `DefinitionRepository` implementation.
//!
//! Versions store their DSL as a JSON blob. The (definition, version number)
//! unique constraint surfaces as `RepositoryError::Conflict`.

use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use conductor_core::repository::DefinitionRepository;
use conductor_types::definition::{WorkflowDefinition, WorkflowDefinitionVersion};
use conductor_types::error::RepositoryError;

use super::{
    SqliteWorkflowStore, db_err, format_datetime, from_json, parse_datetime, parse_enum,
    parse_uuid, to_json,
};

const VERSION_COLUMNS: &str = "id, definition_id, definition_code, version_number, schema_version, status, dsl, changelog, published_at, created_at, created_by, updated_at, updated_by";

fn definition_from_row(row: &SqliteRow) -> Result<WorkflowDefinition, RepositoryError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(db_err)?;
    Ok(WorkflowDefinition {
        id: parse_uuid(&id)?,
        code: row.try_get("code").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        description: row.try_get("description").map_err(db_err)?,
        created_at: parse_datetime(&created_at)?,
        created_by: row.try_get("created_by").map_err(db_err)?,
        updated_at: parse_datetime(&updated_at)?,
        updated_by: row.try_get("updated_by").map_err(db_err)?,
    })
}

fn version_from_row(row: &SqliteRow) -> Result<WorkflowDefinitionVersion, RepositoryError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let definition_id: String = row.try_get("definition_id").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let dsl: String = row.try_get("dsl").map_err(db_err)?;
    let version_number: i64 = row.try_get("version_number").map_err(db_err)?;
    let schema_version: i64 = row.try_get("schema_version").map_err(db_err)?;
    let published_at: Option<String> = row.try_get("published_at").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(db_err)?;

    Ok(WorkflowDefinitionVersion {
        id: parse_uuid(&id)?,
        definition_id: parse_uuid(&definition_id)?,
        definition_code: row.try_get("definition_code").map_err(db_err)?,
        version_number: version_number as u32,
        schema_version: schema_version as u32,
        status: parse_enum(&status)?,
        dsl: from_json(&dsl, "dsl")?,
        changelog: row.try_get("changelog").map_err(db_err)?,
        published_at: published_at.as_deref().map(parse_datetime).transpose()?,
        created_at: parse_datetime(&created_at)?,
        created_by: row.try_get("created_by").map_err(db_err)?,
        updated_at: parse_datetime(&updated_at)?,
        updated_by: row.try_get("updated_by").map_err(db_err)?,
    })
}

impl DefinitionRepository for SqliteWorkflowStore {
    async fn create_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_definitions
               (id, code, name, description, created_at, created_by, updated_at, updated_by)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(def.id.to_string())
        .bind(&def.code)
        .bind(&def.name)
        .bind(&def.description)
        .bind(format_datetime(&def.created_at))
        .bind(&def.created_by)
        .bind(format_datetime(&def.updated_at))
        .bind(&def.updated_by)
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_definition(&self, code: &str) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_definitions WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;
        row.as_ref().map(definition_from_row).transpose()
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM workflow_definitions ORDER BY code ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;
        rows.iter().map(definition_from_row).collect()
    }

    async fn create_version(&self, version: &WorkflowDefinitionVersion) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            "INSERT INTO workflow_definition_versions ({VERSION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(version.id.to_string())
        .bind(version.definition_id.to_string())
        .bind(&version.definition_code)
        .bind(version.version_number as i64)
        .bind(version.schema_version as i64)
        .bind(version.status.as_str())
        .bind(to_json(&version.dsl)?)
        .bind(&version.changelog)
        .bind(version.published_at.as_ref().map(format_datetime))
        .bind(format_datetime(&version.created_at))
        .bind(&version.created_by)
        .bind(format_datetime(&version.updated_at))
        .bind(&version.updated_by)
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_version(&self, version: &WorkflowDefinitionVersion) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_definition_versions
               SET schema_version = ?, status = ?, dsl = ?, changelog = ?, published_at = ?,
                   updated_at = ?, updated_by = ?
               WHERE id = ?"#,
        )
        .bind(version.schema_version as i64)
        .bind(version.status.as_str())
        .bind(to_json(&version.dsl)?)
        .bind(&version.changelog)
        .bind(version.published_at.as_ref().map(format_datetime))
        .bind(format_datetime(&version.updated_at))
        .bind(&version.updated_by)
        .bind(version.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_version(
        &self,
        code: &str,
        version_number: u32,
    ) -> Result<Option<WorkflowDefinitionVersion>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_definition_versions WHERE definition_code = ? AND version_number = ?"
        ))
        .bind(code)
        .bind(version_number as i64)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(db_err)?;
        row.as_ref().map(version_from_row).transpose()
    }

    async fn latest_published_version(
        &self,
        code: &str,
    ) -> Result<Option<WorkflowDefinitionVersion>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_definition_versions
             WHERE definition_code = ? AND status = 'published'
             ORDER BY version_number DESC LIMIT 1"
        ))
        .bind(code)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(db_err)?;
        row.as_ref().map(version_from_row).transpose()
    }

    async fn list_versions(&self, code: &str) -> Result<Vec<WorkflowDefinitionVersion>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_definition_versions WHERE definition_code = ? ORDER BY version_number ASC"
        ))
        .bind(code)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        rows.iter().map(version_from_row).collect()
    }
}
