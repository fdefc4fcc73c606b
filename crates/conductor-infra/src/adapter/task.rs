//! `HumanTaskGateway` that announces tasks on the event bus.
//!
//! Each created task is kept in memory and published as a
//! `HumanTaskRequested` event. Task creation is keyed by the request's
//! idempotency key, so a retried step gets its original task back.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use uuid::Uuid;

use conductor_core::event::EventBus;
use conductor_core::gateway::{GatewayError, HumanTaskGateway, HumanTaskRequest, HumanTaskState};
use conductor_types::event::IntegrationEvent;

struct TaskEntry {
    request: HumanTaskRequest,
    state: HumanTaskState,
}

pub struct BusTaskGateway {
    bus: EventBus<IntegrationEvent>,
    tasks: DashMap<String, TaskEntry>,
    by_key: DashMap<String, String>,
}

impl BusTaskGateway {
    pub fn new(bus: EventBus<IntegrationEvent>) -> Self {
        Self {
            bus,
            tasks: DashMap::new(),
            by_key: DashMap::new(),
        }
    }

    /// Open tasks as (task id, request).
    pub fn open_tasks(&self) -> Vec<(String, HumanTaskRequest)> {
        self.tasks
            .iter()
            .filter(|t| t.state == HumanTaskState::Open)
            .map(|t| (t.key().clone(), t.request.clone()))
            .collect()
    }

    /// Close a task and return the completion event to route back to its run.
    pub fn complete_task(&self, task_id: &str, outcome: Value) -> Result<IntegrationEvent, GatewayError> {
        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| GatewayError::NotFound(task_id.to_string()))?;
        if task.state != HumanTaskState::Open {
            return Err(GatewayError::Rejected(format!("task '{task_id}' is already closed")));
        }
        task.state = HumanTaskState::Completed {
            outcome: outcome.clone(),
        };
        tracing::info!(task_id, run_id = %task.request.run_id, "human task completed");
        Ok(IntegrationEvent::HumanTaskCompleted {
            run_id: task.request.run_id,
            task_id: task_id.to_string(),
            outcome,
        })
    }
}

impl HumanTaskGateway for BusTaskGateway {
    async fn create_task(&self, request: &HumanTaskRequest) -> Result<String, GatewayError> {
        let task_id = match self.by_key.entry(request.idempotency_key.clone()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let task_id = format!("task-{}", Uuid::now_v7());
                slot.insert(task_id.clone());
                task_id
            }
        };

        self.tasks.insert(
            task_id.clone(),
            TaskEntry {
                request: request.clone(),
                state: HumanTaskState::Open,
            },
        );
        tracing::info!(task_id = %task_id, run_id = %request.run_id, step_key = %request.step_key, "human task created");
        self.bus.publish(IntegrationEvent::HumanTaskRequested {
            run_id: request.run_id,
            step_key: request.step_key.clone(),
            task_id: task_id.clone(),
            assignee_type: request.assignee_type.clone(),
            assignee_id: request.assignee_id.clone(),
            payload: request.payload.clone(),
        });
        Ok(task_id)
    }

    async fn task_state(&self, task_id: &str) -> Result<HumanTaskState, GatewayError> {
        self.tasks
            .get(task_id)
            .map(|t| t.state.clone())
            .ok_or_else(|| GatewayError::NotFound(task_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(key: &str) -> HumanTaskRequest {
        HumanTaskRequest {
            run_id: Uuid::now_v7(),
            step_key: "approve".to_string(),
            assignee_type: Some("role".to_string()),
            assignee_id: Some("finance".to_string()),
            title: Some("Approve refund".to_string()),
            payload: json!({ "amount": 40 }),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_and_announced() {
        let bus = EventBus::new(8);
        let mut receiver = bus.subscribe();
        let gateway = BusTaskGateway::new(bus);

        let req = request("run:approve:1");
        let first = gateway.create_task(&req).await.unwrap();
        let second = gateway.create_task(&req).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gateway.open_tasks().len(), 1);

        let IntegrationEvent::HumanTaskRequested { task_id, .. } = receiver.recv().await.unwrap() else {
            panic!("expected a task request");
        };
        assert_eq!(task_id, first);
        assert!(receiver.try_recv().is_err(), "duplicate create must not re-announce");
    }

    #[tokio::test]
    async fn test_complete_task_once() {
        let gateway = BusTaskGateway::new(EventBus::new(8));
        let req = request("run:approve:1");
        let task_id = gateway.create_task(&req).await.unwrap();

        let event = gateway.complete_task(&task_id, json!({ "approved": true })).unwrap();
        assert_eq!(event.name(), "HumanTaskCompleted");
        assert_eq!(
            gateway.task_state(&task_id).await.unwrap(),
            HumanTaskState::Completed { outcome: json!({ "approved": true }) }
        );
        assert!(gateway.open_tasks().is_empty());

        assert!(matches!(
            gateway.complete_task(&task_id, json!({})),
            Err(GatewayError::Rejected(_))
        ));
        assert!(matches!(
            gateway.task_state("missing").await,
            Err(GatewayError::NotFound(_))
        ));
    }
}
