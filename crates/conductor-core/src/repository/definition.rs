//! Definition store trait.
//!
//! Definitions own their versions. Versions are unique per
//! (definition, version number); the store enforces that with a unique
//! constraint and reports violations as `RepositoryError::Conflict`.

use std::future::Future;

use conductor_types::definition::{WorkflowDefinition, WorkflowDefinitionVersion};
use conductor_types::error::RepositoryError;

/// Storage for definitions and their numbered versions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DefinitionRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Insert a new definition. Fails with `Conflict` if the code exists.
    fn create_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_definition(
        &self,
        code: &str,
    ) -> impl Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// All definitions ordered by code.
    fn list_definitions(
        &self,
    ) -> impl Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Versions
    // -----------------------------------------------------------------------

    /// Insert a new version. Fails with `Conflict` if the number is taken.
    fn create_version(
        &self,
        version: &WorkflowDefinitionVersion,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace a version's mutable fields (status, DSL, changelog, audit).
    fn update_version(
        &self,
        version: &WorkflowDefinitionVersion,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_version(
        &self,
        code: &str,
        version_number: u32,
    ) -> impl Future<Output = Result<Option<WorkflowDefinitionVersion>, RepositoryError>> + Send;

    /// Highest Published version of a definition.
    fn latest_published_version(
        &self,
        code: &str,
    ) -> impl Future<Output = Result<Option<WorkflowDefinitionVersion>, RepositoryError>> + Send;

    /// All versions of a definition ordered by version number.
    fn list_versions(
        &self,
        code: &str,
    ) -> impl Future<Output = Result<Vec<WorkflowDefinitionVersion>, RepositoryError>> + Send;
}
