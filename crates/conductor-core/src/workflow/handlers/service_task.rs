//! `service_task`: invoke another service through the external-call proxy.

use std::sync::Arc;

use serde_json::{Map, Value};

use conductor_types::dsl::{StepConfig, StepType};

use crate::gateway::{ExternalCallProxy, ServiceCall};
use crate::workflow::handler::{StepContext, StepHandler, StepOutcome};

pub struct ServiceTaskHandler<P> {
    proxy: Arc<P>,
}

impl<P> ServiceTaskHandler<P> {
    pub fn new(proxy: Arc<P>) -> Self {
        Self { proxy }
    }
}

impl<P: ExternalCallProxy> StepHandler for ServiceTaskHandler<P> {
    fn step_type(&self) -> StepType {
        StepType::ServiceTask
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let StepConfig::ServiceTask {
            method_id,
            params,
            assign_to,
        } = &ctx.step.config
        else {
            return super::config_mismatch(ctx.step);
        };

        let call = ServiceCall {
            method_id: method_id.clone(),
            params: ctx.context.render(params),
            idempotency_key: Some(ctx.execution_key.to_string()),
        };

        match self.proxy.invoke(&call).await {
            Ok(response) if response.success => {
                let key = assign_to.clone().unwrap_or_else(|| ctx.step.id.clone());
                let mut output = Map::new();
                output.insert(key, response.payload);
                StepOutcome::completed(Value::Object(output))
            }
            Ok(response) => {
                let reason = format!(
                    "{method_id} answered {}: {}",
                    response.status_code,
                    response.error.as_deref().unwrap_or("no error message")
                );
                if response.is_retryable() {
                    StepOutcome::retryable(reason)
                } else {
                    StepOutcome::fatal(reason)
                }
            }
            Err(e) if e.is_retryable() => StepOutcome::retryable(format!("{method_id}: {e}")),
            Err(e) => StepOutcome::fatal(format!("{method_id}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::gateway::{ProxyError, ServiceResponse};
    use crate::testing::{RecordingProxy, TestStep};
    use crate::workflow::handler::StepFailure;

    fn reserve_step(assign_to: Option<&str>) -> TestStep {
        TestStep::new(
            StepConfig::ServiceTask {
                method_id: "inventory.reserve".to_string(),
                params: json!({ "order_id": "{{ orderId }}", "qty": "{{ qty }}" }),
                assign_to: assign_to.map(str::to_string),
            },
            json!({ "orderId": "A1", "qty": 2 }),
        )
    }

    #[tokio::test]
    async fn test_renders_params_and_forwards_execution_key() {
        let proxy = Arc::new(RecordingProxy::new());
        let handler = ServiceTaskHandler::new(proxy.clone());
        let test = reserve_step(None);

        handler.execute(&test.ctx()).await;

        let calls = proxy.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].params, json!({ "order_id": "A1", "qty": 2 }));
        assert_eq!(calls[0].idempotency_key.as_deref(), Some(test.execution_key.as_str()));
    }

    #[tokio::test]
    async fn test_success_payload_stored_under_step_id() {
        let proxy = Arc::new(RecordingProxy::new());
        proxy.respond("inventory.reserve", Ok(ServiceResponse::ok(json!({ "hold": "H-9" }))));
        let handler = ServiceTaskHandler::new(proxy);

        let outcome = handler.execute(&reserve_step(None).ctx()).await;
        assert_eq!(outcome, StepOutcome::completed(json!({ "step": { "hold": "H-9" } })));

        let proxy = Arc::new(RecordingProxy::new());
        proxy.respond("inventory.reserve", Ok(ServiceResponse::ok(json!(true))));
        let handler = ServiceTaskHandler::new(proxy);
        let outcome = handler.execute(&reserve_step(Some("reservation")).ctx()).await;
        assert_eq!(outcome, StepOutcome::completed(json!({ "reservation": true })));
    }

    #[tokio::test]
    async fn test_failure_classification() {
        let cases = vec![
            (Ok(ServiceResponse::failed(503, "down")), true),
            (Ok(ServiceResponse::failed(422, "invalid sku")), false),
            (Err(ProxyError::Timeout), true),
            (Err(ProxyError::UnknownMethod("inventory.reserve".into())), false),
        ];
        for (response, retryable) in cases {
            let proxy = Arc::new(RecordingProxy::new());
            proxy.respond("inventory.reserve", response);
            let handler = ServiceTaskHandler::new(proxy);
            match handler.execute(&reserve_step(None).ctx()).await {
                StepOutcome::Failed(StepFailure::Retryable(_)) => assert!(retryable),
                StepOutcome::Failed(StepFailure::Fatal(_)) => assert!(!retryable),
                other => panic!("expected failure, got {other:?}"),
            }
        }
    }
}
