//! Definition administration.
//!
//! Definitions are created once; their step graphs live in numbered
//! versions. A version starts as a Draft (editable), becomes Published
//! after validation (frozen, startable) and may later be Deprecated (frozen,
//! no new runs). Unpublishing back to Draft is allowed only while no run is
//! pinned to the version.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use conductor_types::definition::{
    VersionStatus, WorkflowDefinition, WorkflowDefinitionVersion, MAX_CODE_LEN,
};
use conductor_types::dsl::{StepConfig, WorkflowDsl};
use conductor_types::error::{DefinitionError, RepositoryError};

use crate::repository::{DefinitionRepository, RunRepository};
use crate::workflow::context::RunContext;
use crate::workflow::definition::validate_dsl;
use crate::workflow::expression::WorkflowEvaluator;

/// Result of walking a version's graph without executing anything.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub definition_code: String,
    pub version_number: u32,
    /// Step ids in visiting order; parallel branches follow their parent.
    pub path: Vec<String>,
    /// The context after `assign` steps; service outputs and signals are not simulated.
    pub context: Value,
}

pub struct DefinitionService<S> {
    store: Arc<S>,
}

impl<S: DefinitionRepository + RunRepository> DefinitionService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    pub async fn create_definition(
        &self,
        code: &str,
        name: &str,
        description: Option<String>,
        actor: &str,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        validate_code(code)?;
        let now = Utc::now();
        let definition = WorkflowDefinition {
            id: Uuid::now_v7(),
            code: code.to_string(),
            name: if name.trim().is_empty() { code.to_string() } else { name.trim().to_string() },
            description,
            created_at: now,
            created_by: actor.to_string(),
            updated_at: now,
            updated_by: actor.to_string(),
        };
        self.store
            .create_definition(&definition)
            .await
            .map_err(|e| match e {
                RepositoryError::Conflict(_) => DefinitionError::CodeConflict(code.to_string()),
                other => DefinitionError::Storage(other),
            })?;
        tracing::info!(code, actor, "definition created");
        Ok(definition)
    }

    pub async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, DefinitionError> {
        Ok(self.store.list_definitions().await?)
    }

    async fn definition(&self, code: &str) -> Result<WorkflowDefinition, DefinitionError> {
        self.store
            .get_definition(code)
            .await?
            .ok_or_else(|| DefinitionError::NotFound(code.to_string()))
    }

    // -----------------------------------------------------------------------
    // Versions
    // -----------------------------------------------------------------------

    /// Add a Draft version numbered one past the highest existing version.
    pub async fn create_version(
        &self,
        code: &str,
        dsl: WorkflowDsl,
        changelog: Option<String>,
        actor: &str,
    ) -> Result<WorkflowDefinitionVersion, DefinitionError> {
        let definition = self.definition(code).await?;
        let next_number = self
            .store
            .list_versions(code)
            .await?
            .iter()
            .map(|v| v.version_number)
            .max()
            .unwrap_or(0)
            + 1;

        let now = Utc::now();
        let version = WorkflowDefinitionVersion {
            id: Uuid::now_v7(),
            definition_id: definition.id,
            definition_code: code.to_string(),
            version_number: next_number,
            schema_version: dsl.schema_version,
            status: VersionStatus::Draft,
            dsl,
            changelog,
            published_at: None,
            created_at: now,
            created_by: actor.to_string(),
            updated_at: now,
            updated_by: actor.to_string(),
        };
        self.store.create_version(&version).await?;
        tracing::info!(code, version = next_number, actor, "draft version created");
        Ok(version)
    }

    /// Latest version when `version` is `None`.
    pub async fn get_version(
        &self,
        code: &str,
        version: Option<u32>,
    ) -> Result<WorkflowDefinitionVersion, DefinitionError> {
        match version {
            Some(number) => self
                .store
                .get_version(code, number)
                .await?
                .ok_or_else(|| DefinitionError::VersionNotFound {
                    code: code.to_string(),
                    version: number,
                }),
            None => {
                self.definition(code).await?;
                self.store
                    .list_versions(code)
                    .await?
                    .pop()
                    .ok_or_else(|| DefinitionError::NotFound(code.to_string()))
            }
        }
    }

    pub async fn list_versions(&self, code: &str) -> Result<Vec<WorkflowDefinitionVersion>, DefinitionError> {
        self.definition(code).await?;
        Ok(self.store.list_versions(code).await?)
    }

    /// Replace the DSL of a Draft.
    pub async fn update_draft(
        &self,
        code: &str,
        version: u32,
        dsl: WorkflowDsl,
        actor: &str,
    ) -> Result<WorkflowDefinitionVersion, DefinitionError> {
        let mut stored = self.get_version(code, Some(version)).await?;
        if stored.status != VersionStatus::Draft {
            return Err(immutable(&stored));
        }
        stored.schema_version = dsl.schema_version;
        stored.dsl = dsl;
        stored.updated_at = Utc::now();
        stored.updated_by = actor.to_string();
        self.store.update_version(&stored).await?;
        tracing::info!(code, version, actor, "draft updated");
        Ok(stored)
    }

    /// Validate and freeze a Draft. Publishing a Published version is a no-op.
    pub async fn publish(
        &self,
        code: &str,
        version: u32,
        actor: &str,
    ) -> Result<WorkflowDefinitionVersion, DefinitionError> {
        let mut stored = self.get_version(code, Some(version)).await?;
        match stored.status {
            VersionStatus::Published => return Ok(stored),
            VersionStatus::Deprecated => return Err(immutable(&stored)),
            VersionStatus::Draft => {}
        }
        validate_dsl(&stored.dsl)?;

        let now = Utc::now();
        stored.status = VersionStatus::Published;
        stored.published_at = Some(now);
        stored.updated_at = now;
        stored.updated_by = actor.to_string();
        self.store.update_version(&stored).await?;
        tracing::info!(code, version, actor, "version published");
        Ok(stored)
    }

    /// Stop new runs from starting on a version. Pinned runs continue.
    pub async fn deprecate(
        &self,
        code: &str,
        version: u32,
        actor: &str,
    ) -> Result<WorkflowDefinitionVersion, DefinitionError> {
        let mut stored = self.get_version(code, Some(version)).await?;
        if stored.status == VersionStatus::Deprecated {
            return Ok(stored);
        }
        stored.status = VersionStatus::Deprecated;
        stored.updated_at = Utc::now();
        stored.updated_by = actor.to_string();
        self.store.update_version(&stored).await?;
        tracing::info!(code, version, actor, "version deprecated");
        Ok(stored)
    }

    /// Return a Published version to Draft. Refused once any run is pinned to it.
    pub async fn unpublish(
        &self,
        code: &str,
        version: u32,
        actor: &str,
    ) -> Result<WorkflowDefinitionVersion, DefinitionError> {
        let mut stored = self.get_version(code, Some(version)).await?;
        if stored.status != VersionStatus::Published {
            return Err(immutable(&stored));
        }
        let runs = self.store.count_runs_for_version(code, version).await?;
        if runs > 0 {
            return Err(DefinitionError::InUse {
                code: code.to_string(),
                version,
                runs,
            });
        }

        stored.status = VersionStatus::Draft;
        stored.published_at = None;
        stored.updated_at = Utc::now();
        stored.updated_by = actor.to_string();
        self.store.update_version(&stored).await?;
        tracing::info!(code, version, actor, "version unpublished");
        Ok(stored)
    }

    // -----------------------------------------------------------------------
    // Dry run
    // -----------------------------------------------------------------------

    /// Walk the graph from `start_at` with `input` as the context.
    ///
    /// Branches are evaluated, `assign` values are applied, and pausing
    /// steps are assumed to resume. Nothing is persisted or invoked.
    pub async fn dry_run(
        &self,
        code: &str,
        version: Option<u32>,
        input: Value,
    ) -> Result<DryRunReport, DefinitionError> {
        let stored = self.get_version(code, version).await?;
        validate_dsl(&stored.dsl)?;
        let dsl = &stored.dsl;

        let evaluator = WorkflowEvaluator::new();
        let mut context = RunContext::from_value(input);
        let mut path = Vec::new();
        let max_visits = dsl.steps.len() * 10;
        let mut current = Some(dsl.start_at.clone());

        while let Some(step_id) = current.take() {
            if path.len() >= max_visits {
                return Err(DefinitionError::Validation(format!(
                    "dry run did not terminate after {max_visits} steps"
                )));
            }
            let Some(step) = dsl.step(&step_id) else {
                return Err(DefinitionError::Validation(format!("unknown step '{step_id}'")));
            };
            path.push(step.id.clone());

            current = match &step.config {
                StepConfig::Branch { branches, default } => {
                    let data = Value::Object(context.as_map().clone());
                    let matched = evaluator
                        .first_match(branches, &data)
                        .map_err(|e| DefinitionError::Validation(format!("step '{}': {e}", step.id)))?;
                    matched.map(|rule| rule.to.clone()).or_else(|| default.clone())
                }
                StepConfig::Assign { values } => {
                    let rendered = context.render(&Value::Object(values.clone()));
                    context.merge(&rendered);
                    step.next.clone()
                }
                StepConfig::Parallel { branches } => {
                    path.extend(branches.iter().cloned());
                    step.next.clone()
                }
                _ => step.next.clone(),
            };
        }

        Ok(DryRunReport {
            definition_code: code.to_string(),
            version_number: stored.version_number,
            path,
            context: context.into_value(),
        })
    }
}

fn immutable(version: &WorkflowDefinitionVersion) -> DefinitionError {
    DefinitionError::Immutable {
        code: version.definition_code.clone(),
        version: version.version_number,
        status: version.status.to_string(),
    }
}

/// Codes are 1..=128 characters of ASCII letters, digits, `-`, `_` and `.`.
pub fn validate_code(code: &str) -> Result<(), DefinitionError> {
    if code.is_empty() {
        return Err(DefinitionError::InvalidCode("code must not be empty".to_string()));
    }
    if code.len() > MAX_CODE_LEN {
        return Err(DefinitionError::InvalidCode(format!(
            "code exceeds {MAX_CODE_LEN} characters"
        )));
    }
    if let Some(bad) = code
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(DefinitionError::InvalidCode(format!(
            "unexpected character '{bad}' in '{code}'"
        )));
    }
    Ok(())
}
