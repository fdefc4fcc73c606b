//! Built-in step handlers, one per `StepType`.
//!
//! Handlers resolve `{{ path }}` templates from the run context, perform
//! their step logic through the collaborator ports they were constructed
//! with, and return a `StepOutcome`. They never touch the store.

mod emit_event;
mod flow;
mod human_task;
mod service_task;
mod sub_workflow;
mod wait;

use std::sync::Arc;

use conductor_types::dsl::StepSpec;

use crate::gateway::{EventPublisher, ExternalCallProxy, HumanTaskGateway};

use super::handler::{StepHandlerRegistry, StepOutcome};

pub use emit_event::EmitEventHandler;
pub use flow::{AssignHandler, BranchHandler, ParallelHandler};
pub use human_task::HumanTaskHandler;
pub use service_task::ServiceTaskHandler;
pub use sub_workflow::SubWorkflowHandler;
pub use wait::{TimerHandler, WaitForSignalHandler};

impl StepHandlerRegistry {
    /// A registry with the built-in handler for every step type.
    pub fn standard<P, G, E>(proxy: Arc<P>, gateway: Arc<G>, publisher: Arc<E>) -> Self
    where
        P: ExternalCallProxy + 'static,
        G: HumanTaskGateway + 'static,
        E: EventPublisher + 'static,
    {
        StepHandlerRegistry::new()
            .with(ServiceTaskHandler::new(proxy))
            .with(HumanTaskHandler::new(gateway))
            .with(WaitForSignalHandler)
            .with(TimerHandler)
            .with(SubWorkflowHandler)
            .with(BranchHandler)
            .with(ParallelHandler)
            .with(EmitEventHandler::new(publisher))
            .with(AssignHandler)
    }
}

/// Outcome for a step whose config payload does not match its type.
fn config_mismatch(step: &StepSpec) -> StepOutcome {
    StepOutcome::fatal(format!(
        "step '{}' declares type {} but carries a {} config",
        step.id,
        step.step_type,
        step.config.step_type()
    ))
}
