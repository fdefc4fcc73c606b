//! `emit_event`: publish an outbound integration event.

use std::sync::Arc;

use conductor_types::dsl::{StepConfig, StepType};
use conductor_types::event::IntegrationEvent;

use crate::gateway::EventPublisher;
use crate::workflow::handler::{StepContext, StepHandler, StepOutcome};

pub struct EmitEventHandler<E> {
    publisher: Arc<E>,
}

impl<E> EmitEventHandler<E> {
    pub fn new(publisher: Arc<E>) -> Self {
        Self { publisher }
    }
}

impl<E: EventPublisher> StepHandler for EmitEventHandler<E> {
    fn step_type(&self) -> StepType {
        StepType::EmitEvent
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let StepConfig::EmitEvent {
            event_name,
            payload,
        } = &ctx.step.config
        else {
            return super::config_mismatch(ctx.step);
        };

        let event = IntegrationEvent::Custom {
            name: event_name.clone(),
            run_id: Some(ctx.run.id),
            correlation_id: ctx.run.correlation_id.clone(),
            payload: ctx.context.render(payload),
        };

        match self.publisher.publish(event).await {
            Ok(()) => StepOutcome::done(),
            Err(e) => StepOutcome::retryable(format!("publishing {event_name}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::testing::{RecordingPublisher, TestStep};

    #[tokio::test]
    async fn test_publishes_rendered_event_with_correlation() {
        let publisher = Arc::new(RecordingPublisher::new());
        let handler = EmitEventHandler::new(publisher.clone());
        let mut test = TestStep::new(
            StepConfig::EmitEvent {
                event_name: "OrderShipped".to_string(),
                payload: json!({ "order": "{{ orderId }}" }),
            },
            json!({ "orderId": "A1" }),
        );
        test.run.correlation_id = Some("A1".to_string());

        let outcome = handler.execute(&test.ctx()).await;
        assert_eq!(outcome, StepOutcome::done());

        let events = publisher.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            IntegrationEvent::Custom {
                name,
                run_id,
                correlation_id,
                payload,
            } => {
                assert_eq!(name, "OrderShipped");
                assert_eq!(*run_id, Some(test.run.id));
                assert_eq!(correlation_id.as_deref(), Some("A1"));
                assert_eq!(payload, &json!({ "order": "A1" }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
