//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (conductor-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod definition;
pub mod idempotency;
pub mod run;

pub use definition::DefinitionRepository;
pub use idempotency::IdempotencyRepository;
pub use run::RunRepository;

/// Everything the engine persists, behind one store handle.
///
/// Blanket-implemented for any type implementing all three repositories.
pub trait WorkflowStore: DefinitionRepository + RunRepository + IdempotencyRepository {}

impl<T> WorkflowStore for T where T: DefinitionRepository + RunRepository + IdempotencyRepository {}
