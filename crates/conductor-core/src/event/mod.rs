//! In-process event distribution.
//!
//! `EventBus` is a broadcast channel shared by producers and consumers.
//! The engine publishes `EngineEvent` lifecycle notifications on one; the
//! infrastructure layer carries `IntegrationEvent` traffic on others.

pub mod bus;

pub use bus::{EngineEvent, EventBus};
