//! `EventPublisher` backed by the integration event bus.

use conductor_core::event::EventBus;
use conductor_core::gateway::{EventPublisher, PublishError};
use conductor_types::event::IntegrationEvent;

pub struct BusEventPublisher {
    bus: EventBus<IntegrationEvent>,
}

impl BusEventPublisher {
    pub fn new(bus: EventBus<IntegrationEvent>) -> Self {
        Self { bus }
    }
}

impl EventPublisher for BusEventPublisher {
    async fn publish(&self, event: IntegrationEvent) -> Result<(), PublishError> {
        tracing::debug!(event = event.name(), receivers = self.bus.receiver_count(), "publishing integration event");
        self.bus.publish(event);
        Ok(())
    }
}
