//! `sub_workflow`: start a child run of another definition.
//!
//! The child is created Pending through the attempt's `ChildRunLauncher`;
//! the engine drives it once the parent's step has been committed. With
//! `wait` the parent pauses until the child reports back.

use serde_json::{json, Map, Value};

use conductor_types::dsl::{
    StepConfig, StepType, SUB_WORKFLOW_COMPLETED_SIGNAL, SUB_WORKFLOW_FAILED_SIGNAL,
};
use conductor_types::run::DeadlineAction;

use crate::workflow::handler::{
    ChildRunRequest, StepContext, StepHandler, StepOutcome, WaitRequest,
};

pub struct SubWorkflowHandler;

impl StepHandler for SubWorkflowHandler {
    fn step_type(&self) -> StepType {
        StepType::SubWorkflow
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let StepConfig::SubWorkflow {
            definition_code,
            version,
            input,
            wait,
        } = &ctx.step.config
        else {
            return super::config_mismatch(ctx.step);
        };

        let request = ChildRunRequest {
            definition_code: definition_code.clone(),
            version: *version,
            input: ctx.context.render(input),
            parent_run_id: ctx.run.id,
            correlation_id: ctx.run.correlation_id.clone(),
            initiated_by: format!("run:{}", ctx.run.id),
        };

        let child_run_id = match ctx.children.launch(request).await {
            Ok(id) => id,
            Err(failure) => return StepOutcome::Failed(failure),
        };

        if *wait {
            StepOutcome::Waiting(WaitRequest {
                signal: SUB_WORKFLOW_COMPLETED_SIGNAL.to_string(),
                fail_on: vec![SUB_WORKFLOW_FAILED_SIGNAL.to_string()],
                timeout_secs: ctx.step.timeout_secs,
                on_deadline: DeadlineAction::Fail,
                request: Some(json!({ "child_run_id": child_run_id })),
            })
        } else {
            let mut output = Map::new();
            output.insert(ctx.step.id.clone(), json!({ "child_run_id": child_run_id }));
            StepOutcome::completed(Value::Object(output))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::testing::{RecordingLauncher, TestStep};
    use crate::workflow::handler::StepFailure;

    fn shipping_step(wait: bool) -> StepConfig {
        StepConfig::SubWorkflow {
            definition_code: "Shipping".to_string(),
            version: Some(3),
            input: json!({ "order": "{{ orderId }}" }),
            wait,
        }
    }

    #[tokio::test]
    async fn test_waiting_child_pauses_parent() {
        let launcher = RecordingLauncher::new();
        let test = TestStep::new(shipping_step(true), json!({ "orderId": "A1" }));
        let ctx = test.ctx_with_children(&launcher);

        let outcome = SubWorkflowHandler.execute(&ctx).await;

        let requests = launcher.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].definition_code, "Shipping");
        assert_eq!(requests[0].version, Some(3));
        assert_eq!(requests[0].input, json!({ "order": "A1" }));
        assert_eq!(requests[0].parent_run_id, test.run.id);

        match outcome {
            StepOutcome::Waiting(wait) => {
                assert_eq!(wait.signal, SUB_WORKFLOW_COMPLETED_SIGNAL);
                assert_eq!(wait.fail_on, vec![SUB_WORKFLOW_FAILED_SIGNAL.to_string()]);
                assert_eq!(
                    wait.request,
                    Some(json!({ "child_run_id": launcher.launched()[0] }))
                );
            }
            other => panic!("expected waiting, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fire_and_forget_child_completes_step() {
        let launcher = RecordingLauncher::new();
        let test = TestStep::new(shipping_step(false), json!({ "orderId": "A1" }));

        let outcome = SubWorkflowHandler
            .execute(&test.ctx_with_children(&launcher))
            .await;
        let child = launcher.launched()[0];
        assert_eq!(
            outcome,
            StepOutcome::completed(json!({ "step": { "child_run_id": child } }))
        );
    }

    #[tokio::test]
    async fn test_launch_failure_propagates() {
        let test = TestStep::new(shipping_step(true), json!({}));
        let outcome = SubWorkflowHandler.execute(&test.ctx()).await;
        assert!(matches!(outcome, StepOutcome::Failed(StepFailure::Fatal(_))));
    }
}
