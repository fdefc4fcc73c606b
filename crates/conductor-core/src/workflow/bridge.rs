//! Event bridge: turns inbound integration events into run starts and signals.
//!
//! | Event              | Effect                                                  |
//! |--------------------|---------------------------------------------------------|
//! | OrderPlaced        | idempotent start of the configured definition           |
//! | PaymentConfirmed   | signal to the runs correlated by order id               |
//! | PaymentFailed      | signal to the runs correlated by order id               |
//! | HumanTaskCompleted | `HumanTaskCompleted` signal to the run                  |
//! | FormSubmitted      | `FormSubmitted` signal to the run                       |
//! | Custom             | signal of the same name, by run id or correlation id    |
//!
//! Delivery is at-least-once, so every effect tolerates duplicates: starts
//! are keyed by order id and repeated signals are recorded as stale.

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_types::config::BridgeConfig;
use conductor_types::dsl::HUMAN_TASK_COMPLETED_SIGNAL;
use conductor_types::event::IntegrationEvent;

use crate::repository::WorkflowStore;

use super::engine::{StartRequest, WorkflowEngine};
use super::error::EngineError;
use super::signal::SignalDelivery;

/// What the bridge did with one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BridgeAction {
    Started { run_id: Uuid },
    Signalled { deliveries: Vec<SignalDelivery> },
    Ignored { reason: String },
}

pub struct EventBridge<S> {
    engine: WorkflowEngine<S>,
    config: BridgeConfig,
}

impl<S: WorkflowStore + 'static> EventBridge<S> {
    pub fn new(engine: WorkflowEngine<S>) -> Self {
        let config = engine.config().bridge.clone();
        Self { engine, config }
    }

    /// Consume events until `cancel` fires or the channel closes.
    pub async fn run(&self, mut events: broadcast::Receiver<IntegrationEvent>, cancel: CancellationToken) {
        tracing::info!("event bridge started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        let name = event.name().to_string();
                        match self.handle(event).await {
                            Ok(action) => tracing::debug!(event = %name, ?action, "integration event routed"),
                            Err(e) => tracing::error!(event = %name, error = %e, "failed to route integration event"),
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event bridge lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
        tracing::info!("event bridge stopped");
    }

    /// Route one event.
    pub async fn handle(&self, event: IntegrationEvent) -> Result<BridgeAction, EngineError> {
        match event {
            IntegrationEvent::OrderPlaced { order_id, payload } => {
                self.order_placed(order_id, payload).await
            }
            IntegrationEvent::PaymentConfirmed { order_id, payload } => {
                self.by_correlation(&order_id, "PaymentConfirmed", payload).await
            }
            IntegrationEvent::PaymentFailed { order_id, payload } => {
                self.by_correlation(&order_id, "PaymentFailed", payload).await
            }
            IntegrationEvent::HumanTaskCompleted {
                run_id,
                task_id,
                outcome,
            } => {
                let payload = with_field(outcome, "task_id", json!(task_id));
                self.to_run(run_id, HUMAN_TASK_COMPLETED_SIGNAL, payload).await
            }
            IntegrationEvent::FormSubmitted {
                run_id,
                form_id,
                data,
            } => {
                let payload = with_field(data, "form_id", json!(form_id));
                self.to_run(run_id, "FormSubmitted", payload).await
            }
            IntegrationEvent::Custom {
                name,
                run_id,
                correlation_id,
                payload,
            } => match (run_id, correlation_id) {
                (Some(run_id), _) => self.to_run(run_id, &name, payload).await,
                (None, Some(correlation_id)) => self.by_correlation(&correlation_id, &name, payload).await,
                (None, None) => {
                    tracing::warn!(event = %name, "custom event carries neither run id nor correlation id");
                    Ok(ignored("no run id or correlation id"))
                }
            },
            IntegrationEvent::HumanTaskRequested { .. } => Ok(ignored("outbound event")),
        }
    }

    async fn order_placed(&self, order_id: String, payload: Value) -> Result<BridgeAction, EngineError> {
        let Some(code) = self.config.order_placed_definition.clone() else {
            return Ok(ignored("order start disabled"));
        };
        let input = with_field(payload, "orderId", json!(order_id));
        let request = StartRequest::new(code, input)
            .with_correlation(&order_id)
            .initiated_by(&self.config.actor);

        let key = format!("order-placed:{order_id}");
        match self.engine.start_idempotent(&key, request).await {
            Ok(run) => Ok(BridgeAction::Started { run_id: run.id }),
            // The run exists; its failure is recorded on it.
            Err(EngineError::StepExecutionFailed { run_id, .. }) => Ok(BridgeAction::Started { run_id }),
            Err(e) => Err(e),
        }
    }

    async fn by_correlation(
        &self,
        correlation_id: &str,
        name: &str,
        payload: Value,
    ) -> Result<BridgeAction, EngineError> {
        let deliveries = self
            .engine
            .signal_by_correlation(correlation_id, name, payload)
            .await?;
        if deliveries.is_empty() {
            return Ok(ignored("no correlated run"));
        }
        Ok(BridgeAction::Signalled { deliveries })
    }

    async fn to_run(&self, run_id: Uuid, name: &str, payload: Value) -> Result<BridgeAction, EngineError> {
        match self.engine.signal(run_id, name, payload).await {
            Ok(outcome) => Ok(BridgeAction::Signalled {
                deliveries: vec![SignalDelivery { run_id, outcome }],
            }),
            Err(EngineError::RunNotFound(_)) => {
                tracing::warn!(run_id = %run_id, signal = name, "event for unknown run dropped");
                Ok(ignored("unknown run"))
            }
            Err(e) => Err(e),
        }
    }
}

fn ignored(reason: &str) -> BridgeAction {
    BridgeAction::Ignored {
        reason: reason.to_string(),
    }
}

/// Add `key` to an object payload; other payloads are wrapped under `data`.
fn with_field(payload: Value, key: &str, value: Value) -> Value {
    let mut fields = match payload {
        Value::Object(fields) => fields,
        Value::Null => Map::new(),
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("data".to_string(), other);
            wrapped
        }
    };
    fields.insert(key.to_string(), value);
    Value::Object(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use conductor_types::definition::VersionStatus;
    use conductor_types::run::RunStatus;

    use crate::event::EventBus;
    use crate::workflow::signal::SignalOutcome;
    use crate::testing::{test_config, EngineHarness};
    use crate::workflow::definition::parse_dsl_yaml;

    const ORDER_FULFILLMENT: &str = r#"
start_at: reserve-inventory
steps:
  - id: reserve-inventory
    type: service_task
    config: { type: service_task, method_id: inventory.reserve, params: { order_id: "{{ orderId }}" } }
    next: await-payment
  - id: await-payment
    type: wait_for_signal
    config: { type: wait_for_signal, signal: PaymentConfirmed, fail_on: [PaymentFailed] }
"#;

    fn harness() -> (EngineHarness, EventBridge<crate::testing::InMemoryStore>) {
        let h = EngineHarness::new(test_config());
        h.store.seed_version(
            "OrderFulfillment",
            1,
            VersionStatus::Published,
            parse_dsl_yaml(ORDER_FULFILLMENT).unwrap(),
        );
        let bridge = EventBridge::new(h.engine.clone());
        (h, bridge)
    }

    fn order_placed(order_id: &str) -> IntegrationEvent {
        IntegrationEvent::OrderPlaced {
            order_id: order_id.to_string(),
            payload: json!({ "total": 40 }),
        }
    }

    #[tokio::test]
    async fn test_duplicate_order_placed_starts_one_run() {
        let (h, bridge) = harness();
        let first = bridge.handle(order_placed("A1")).await.unwrap();
        let second = bridge.handle(order_placed("A1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.store.run_count(), 1);

        let BridgeAction::Started { run_id } = first else {
            panic!("expected a start");
        };
        let run = h.engine.get_run(run_id).await.unwrap();
        assert_eq!(run.correlation_id.as_deref(), Some("A1"));
        assert_eq!(run.initiated_by, "event-bridge");
        assert_eq!(run.input_context["orderId"], "A1");
        assert_eq!(run.input_context["total"], 40);
    }

    #[tokio::test]
    async fn test_payment_events_signal_by_order_id() {
        let (_h, bridge) = harness();
        bridge.handle(order_placed("A1")).await.unwrap();

        let action = bridge
            .handle(IntegrationEvent::PaymentConfirmed {
                order_id: "A1".to_string(),
                payload: json!({ "amount": 100 }),
            })
            .await
            .unwrap();
        let BridgeAction::Signalled { deliveries } = action else {
            panic!("expected a signal");
        };
        assert_eq!(
            deliveries[0].outcome,
            SignalOutcome::Accepted { status: RunStatus::Completed }
        );

        // Redelivery after completion is recorded as stale.
        let again = bridge
            .handle(IntegrationEvent::PaymentConfirmed {
                order_id: "A1".to_string(),
                payload: json!({ "amount": 100 }),
            })
            .await
            .unwrap();
        let BridgeAction::Signalled { deliveries } = again else {
            panic!("expected a signal");
        };
        assert_eq!(
            deliveries[0].outcome,
            SignalOutcome::Stale { status: RunStatus::Completed }
        );
    }

    #[tokio::test]
    async fn test_unroutable_events_are_ignored() {
        let (_h, bridge) = harness();
        let action = bridge
            .handle(IntegrationEvent::Custom {
                name: "Ping".to_string(),
                run_id: None,
                correlation_id: None,
                payload: json!({}),
            })
            .await
            .unwrap();
        assert!(matches!(action, BridgeAction::Ignored { .. }));

        let action = bridge
            .handle(IntegrationEvent::FormSubmitted {
                run_id: Uuid::now_v7(),
                form_id: "f-1".to_string(),
                data: json!({}),
            })
            .await
            .unwrap();
        assert_eq!(action, ignored("unknown run"));

        let action = bridge
            .handle(IntegrationEvent::PaymentConfirmed {
                order_id: "missing".to_string(),
                payload: json!({}),
            })
            .await
            .unwrap();
        assert_eq!(action, ignored("no correlated run"));
    }

    #[tokio::test]
    async fn test_run_loop_consumes_bus() {
        let (h, bridge) = harness();
        let bus = EventBus::new(16);
        let cancel = CancellationToken::new();
        let receiver = bus.subscribe();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { bridge.run(receiver, cancel).await })
        };

        bus.publish(order_placed("B2"));
        let mut started = false;
        for _ in 0..100 {
            if h.store.run_count() == 1 {
                started = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(started);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_with_field_wraps_scalars() {
        assert_eq!(with_field(Value::Null, "k", json!(1)), json!({ "k": 1 }));
        assert_eq!(
            with_field(json!("raw"), "k", json!(1)),
            json!({ "data": "raw", "k": 1 })
        );
        assert_eq!(
            with_field(json!({ "a": true }), "k", json!(1)),
            json!({ "a": true, "k": 1 })
        );
    }
}
