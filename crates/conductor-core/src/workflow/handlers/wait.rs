//! Pausing steps: `wait_for_signal` and `timer`.
//!
//! Neither does any work of its own. They return `Waiting` and the
//! interpreter persists the paused position; the signal router or the
//! deadline sweeper resumes the run.

use std::future::{ready, Future};

use conductor_types::dsl::{StepConfig, StepType, TIMER_ELAPSED_SIGNAL};
use conductor_types::run::DeadlineAction;

use crate::workflow::handler::{StepContext, StepHandler, StepOutcome, WaitRequest};

pub struct WaitForSignalHandler;

impl StepHandler for WaitForSignalHandler {
    fn step_type(&self) -> StepType {
        StepType::WaitForSignal
    }

    fn execute(&self, ctx: &StepContext<'_>) -> impl Future<Output = StepOutcome> + Send {
        let outcome = match &ctx.step.config {
            StepConfig::WaitForSignal { signal, fail_on } => StepOutcome::Waiting(WaitRequest {
                signal: signal.clone(),
                fail_on: fail_on.clone(),
                timeout_secs: ctx.step.timeout_secs,
                on_deadline: DeadlineAction::Fail,
                request: None,
            }),
            _ => super::config_mismatch(ctx.step),
        };
        ready(outcome)
    }
}

pub struct TimerHandler;

impl StepHandler for TimerHandler {
    fn step_type(&self) -> StepType {
        StepType::Timer
    }

    fn execute(&self, ctx: &StepContext<'_>) -> impl Future<Output = StepOutcome> + Send {
        let outcome = match &ctx.step.config {
            StepConfig::Timer { duration_secs } => StepOutcome::Waiting(WaitRequest {
                signal: TIMER_ELAPSED_SIGNAL.to_string(),
                fail_on: Vec::new(),
                timeout_secs: Some(*duration_secs),
                on_deadline: DeadlineAction::Signal,
                request: None,
            }),
            _ => super::config_mismatch(ctx.step),
        };
        ready(outcome)
    }
}
