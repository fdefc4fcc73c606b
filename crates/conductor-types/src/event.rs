//! Integration events exchanged with the rest of the platform.
//!
//! Inbound events are translated by the event bridge into signals or new
//! runs. Outbound events are published by steps and compensation actions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An at-least-once integration event, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IntegrationEvent {
    /// An order was placed; starts a fulfillment run correlated by order id.
    OrderPlaced {
        order_id: String,
        #[serde(default)]
        payload: Value,
    },
    PaymentConfirmed {
        order_id: String,
        #[serde(default)]
        payload: Value,
    },
    PaymentFailed {
        order_id: String,
        #[serde(default)]
        payload: Value,
    },
    /// Outbound: a human task step asks the task inbox for a task.
    HumanTaskRequested {
        run_id: Uuid,
        step_key: String,
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee_id: Option<String>,
        #[serde(default)]
        payload: Value,
    },
    HumanTaskCompleted {
        run_id: Uuid,
        task_id: String,
        #[serde(default)]
        outcome: Value,
    },
    /// A form submission carrying the run it belongs to.
    FormSubmitted {
        run_id: Uuid,
        form_id: String,
        #[serde(default)]
        data: Value,
    },
    /// Any other named event; routed as a signal of the same name.
    Custom {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        #[serde(default)]
        payload: Value,
    },
}

impl IntegrationEvent {
    /// The event name, which doubles as the signal name when routed to a run.
    pub fn name(&self) -> &str {
        match self {
            IntegrationEvent::OrderPlaced { .. } => "OrderPlaced",
            IntegrationEvent::PaymentConfirmed { .. } => "PaymentConfirmed",
            IntegrationEvent::PaymentFailed { .. } => "PaymentFailed",
            IntegrationEvent::HumanTaskRequested { .. } => "HumanTaskRequested",
            IntegrationEvent::HumanTaskCompleted { .. } => "HumanTaskCompleted",
            IntegrationEvent::FormSubmitted { .. } => "FormSubmitted",
            IntegrationEvent::Custom { name, .. } => name,
        }
    }

    /// Build an outbound event from a step or compensation action.
    pub fn custom(name: impl Into<String>, run_id: Uuid, payload: Value) -> Self {
        IntegrationEvent::Custom {
            name: name.into(),
            run_id: Some(run_id),
            correlation_id: None,
            payload,
        }
    }
}
