//! In-process collaborator adapters.
//!
//! These satisfy the gateway ports of `conductor-core` without a remote
//! service: outbound events and task requests go onto the integration event
//! bus, and service calls are answered locally and logged. A deployment
//! talking to real services swaps these for network clients.

pub mod proxy;
pub mod publisher;
pub mod task;

pub use proxy::LoggingCallProxy;
pub use publisher::BusEventPublisher;
pub use task::BusTaskGateway;
