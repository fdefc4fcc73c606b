//! Outbound integration event port.

use std::future::Future;

use conductor_types::event::IntegrationEvent;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}

/// At-least-once publisher of integration events.
pub trait EventPublisher: Send + Sync {
    fn publish(
        &self,
        event: IntegrationEvent,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}
