//! Control-flow steps that only read or write the run context:
//! `branch`, `parallel`, and `assign`.

use std::future::{ready, Future};

use serde_json::Value;

use conductor_types::dsl::{StepConfig, StepType};

use crate::workflow::expression::WorkflowEvaluator;
use crate::workflow::handler::{Route, StepContext, StepHandler, StepOutcome};

// ---------------------------------------------------------------------------
// Branch
// ---------------------------------------------------------------------------

/// Ordered conditional routing: the first rule whose `when` holds wins,
/// otherwise the default target.
pub struct BranchHandler;

impl BranchHandler {
    fn route(ctx: &StepContext<'_>) -> StepOutcome {
        let StepConfig::Branch { branches, default } = &ctx.step.config else {
            return super::config_mismatch(ctx.step);
        };

        let data = Value::Object(ctx.context.as_map().clone());
        let evaluator = WorkflowEvaluator::new();
        match evaluator.first_match(branches, &data) {
            Ok(Some(rule)) => StepOutcome::Completed {
                output: None,
                route: Route::Goto {
                    target: rule.to.clone(),
                    condition: Some(rule.when.clone()),
                },
            },
            Ok(None) => match default {
                Some(target) => StepOutcome::Completed {
                    output: None,
                    route: Route::Goto {
                        target: target.clone(),
                        condition: None,
                    },
                },
                None => StepOutcome::fatal(format!(
                    "branch '{}' matched no rule and has no default",
                    ctx.step.id
                )),
            },
            Err(e) => StepOutcome::fatal(e.to_string()),
        }
    }
}

impl StepHandler for BranchHandler {
    fn step_type(&self) -> StepType {
        StepType::Branch
    }

    fn execute(&self, ctx: &StepContext<'_>) -> impl Future<Output = StepOutcome> + Send {
        ready(Self::route(ctx))
    }
}

// ---------------------------------------------------------------------------
// Parallel
// ---------------------------------------------------------------------------

/// Fan-out marker. The interpreter executes the branch steps and joins them.
pub struct ParallelHandler;

impl StepHandler for ParallelHandler {
    fn step_type(&self) -> StepType {
        StepType::Parallel
    }

    fn execute(&self, ctx: &StepContext<'_>) -> impl Future<Output = StepOutcome> + Send {
        let outcome = match &ctx.step.config {
            StepConfig::Parallel { branches } => StepOutcome::Completed {
                output: None,
                route: Route::FanOut {
                    branches: branches.clone(),
                },
            },
            _ => super::config_mismatch(ctx.step),
        };
        ready(outcome)
    }
}

// ---------------------------------------------------------------------------
// Assign
// ---------------------------------------------------------------------------

/// Writes rendered values into the context.
pub struct AssignHandler;

impl StepHandler for AssignHandler {
    fn step_type(&self) -> StepType {
        StepType::Assign
    }

    fn execute(&self, ctx: &StepContext<'_>) -> impl Future<Output = StepOutcome> + Send {
        let outcome = match &ctx.step.config {
            StepConfig::Assign { values } => {
                StepOutcome::completed(ctx.context.render(&Value::Object(values.clone())))
            }
            _ => super::config_mismatch(ctx.step),
        };
        ready(outcome)
    }
}
