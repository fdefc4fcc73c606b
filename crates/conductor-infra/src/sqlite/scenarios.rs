//! Order fulfillment end to end against a SQLite file.

use std::sync::Arc;

use serde_json::json;

use conductor_core::event::EventBus;
use conductor_core::repository::RunRepository;
use conductor_core::service::definition::DefinitionService;
use conductor_core::workflow::definition::parse_dsl_yaml;
use conductor_core::workflow::engine::{StartRequest, WorkflowEngine};
use conductor_core::workflow::signal::SignalOutcome;
use conductor_types::config::EngineConfig;
use conductor_types::run::{CompensationStatus, RunStatus, SignalDisposition, StepStatus};

use crate::adapter::{BusEventPublisher, BusTaskGateway, LoggingCallProxy};
use crate::crypto::hash::Sha256BodyHasher;

use super::SqliteWorkflowStore;
use super::test_support::temp_store;

const ORDER_FULFILLMENT: &str = r#"
start_at: reserve-inventory
steps:
  - id: reserve-inventory
    type: service_task
    config:
      type: service_task
      method_id: inventory.reserve
      params: { order_id: "{{ orderId }}" }
    next: await-payment
    compensation:
      - kind: service_call
        method_id: inventory.release
        params: { order_id: "{{ orderId }}" }
  - id: await-payment
    type: wait_for_signal
    config: { type: wait_for_signal, signal: PaymentConfirmed, fail_on: [PaymentFailed] }
"#;

async fn engine() -> (tempfile::TempDir, WorkflowEngine<SqliteWorkflowStore>) {
    let (dir, store) = temp_store().await;
    let store = Arc::new(store);

    let admin = DefinitionService::new(store.clone());
    admin
        .create_definition("OrderFulfillment", "Order fulfillment", None, "tester")
        .await
        .unwrap();
    admin
        .create_version("OrderFulfillment", parse_dsl_yaml(ORDER_FULFILLMENT).unwrap(), None, "tester")
        .await
        .unwrap();
    admin.publish("OrderFulfillment", 1, "tester").await.unwrap();

    let mut config = EngineConfig::default();
    config.compensation.background = false;
    config.default_retry_backoff_ms = 0;

    let outbound = EventBus::new(64);
    let engine = WorkflowEngine::standard(
        store,
        Arc::new(LoggingCallProxy::new()),
        Arc::new(BusTaskGateway::new(outbound.clone())),
        Arc::new(BusEventPublisher::new(outbound)),
        Arc::new(Sha256BodyHasher::new()),
        config,
    );
    (dir, engine)
}

fn order(order_id: &str) -> StartRequest {
    StartRequest::new("OrderFulfillment", json!({ "orderId": order_id }))
        .with_correlation(order_id)
        .initiated_by("tester")
}

#[tokio::test]
async fn test_payment_confirmed_then_duplicate() {
    let (_dir, engine) = engine().await;
    let run = engine.start(order("A1")).await.unwrap();
    assert_eq!(run.status, RunStatus::Waiting);
    assert_eq!(run.current_step.as_deref(), Some("await-payment"));

    let deliveries = engine
        .signal_by_correlation("A1", "PaymentConfirmed", json!({ "amount": 100 }))
        .await
        .unwrap();
    assert_eq!(
        deliveries[0].outcome,
        SignalOutcome::Accepted { status: RunStatus::Completed }
    );

    let again = engine
        .signal(run.id, "PaymentConfirmed", json!({ "amount": 100 }))
        .await
        .unwrap();
    assert_eq!(again, SignalOutcome::Stale { status: RunStatus::Completed });

    let history = engine.get_history(run.id).await.unwrap();
    assert_eq!(history.run.status, RunStatus::Completed);
    assert!(history.run.ended_at.is_some());
    assert!(history.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(
        history.signals.iter().map(|s| s.disposition).collect::<Vec<_>>(),
        vec![SignalDisposition::Accepted, SignalDisposition::Stale]
    );
    assert!(history.compensations.is_empty());
}

#[tokio::test]
async fn test_payment_failed_compensates() {
    let (_dir, engine) = engine().await;
    let run = engine.start(order("A2")).await.unwrap();

    engine
        .signal_by_correlation("A2", "PaymentFailed", json!({ "reason": "card declined" }))
        .await
        .unwrap();

    let history = engine.get_history(run.id).await.unwrap();
    assert_eq!(history.run.status, RunStatus::Compensated);
    assert_eq!(history.compensations.len(), 1);
    assert_eq!(history.compensations[0].status, CompensationStatus::Succeeded);

    let summary = engine.compensate(run.id).await.unwrap();
    assert_eq!(summary.invoked, 0);
}

#[tokio::test]
async fn test_idempotent_start_survives_duplicates() {
    let (_dir, engine) = engine().await;
    let first = engine.start_idempotent("order-A3", order("A3")).await.unwrap();
    let second = engine.start_idempotent("order-A3", order("A3")).await.unwrap();
    assert_eq!(first.id, second.id);

    let runs = engine.store().find_by_correlation("A3").await.unwrap();
    assert_eq!(runs.len(), 1);
}
