//! `human_task`: create a task for a person, then wait for its completion.

use std::sync::Arc;

use serde_json::json;

use conductor_types::dsl::{StepConfig, StepType, HUMAN_TASK_COMPLETED_SIGNAL};
use conductor_types::run::DeadlineAction;

use crate::gateway::{GatewayError, HumanTaskGateway, HumanTaskRequest};
use crate::workflow::handler::{StepContext, StepHandler, StepOutcome, WaitRequest};

pub struct HumanTaskHandler<G> {
    gateway: Arc<G>,
}

impl<G> HumanTaskHandler<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self { gateway }
    }
}

impl<G: HumanTaskGateway> StepHandler for HumanTaskHandler<G> {
    fn step_type(&self) -> StepType {
        StepType::HumanTask
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let StepConfig::HumanTask {
            assignee_type,
            assignee_id,
            title,
            payload,
            completion_signal,
            rejection_signal,
        } = &ctx.step.config
        else {
            return super::config_mismatch(ctx.step);
        };

        let request = HumanTaskRequest {
            run_id: ctx.run.id,
            step_key: ctx.step.id.clone(),
            assignee_type: assignee_type.clone(),
            assignee_id: assignee_id.as_deref().map(|a| ctx.context.resolve_template(a)),
            title: title.as_deref().map(|t| ctx.context.resolve_template(t)),
            payload: ctx.context.render(payload),
            idempotency_key: ctx.execution_key.to_string(),
        };

        match self.gateway.create_task(&request).await {
            Ok(task_id) => StepOutcome::Waiting(WaitRequest {
                signal: completion_signal
                    .clone()
                    .unwrap_or_else(|| HUMAN_TASK_COMPLETED_SIGNAL.to_string()),
                fail_on: rejection_signal.iter().cloned().collect(),
                timeout_secs: ctx.step.timeout_secs,
                on_deadline: DeadlineAction::Fail,
                request: Some(json!({ "task_id": task_id })),
            }),
            Err(GatewayError::Unavailable(reason)) => {
                StepOutcome::retryable(format!("task inbox unavailable: {reason}"))
            }
            Err(e) => StepOutcome::fatal(e.to_string()),
        }
    }
}
