//! Collaborator interfaces consumed by step and compensation handlers.
//!
//! The engine never talks to other services directly. Handlers receive
//! these ports at construction; conductor-infra provides the adapters.

pub mod human_task;
pub mod proxy;
pub mod publisher;

pub use human_task::{GatewayError, HumanTaskGateway, HumanTaskRequest, HumanTaskState};
pub use proxy::{ExternalCallProxy, ProxyError, ServiceCall, ServiceResponse};
pub use publisher::{EventPublisher, PublishError};
