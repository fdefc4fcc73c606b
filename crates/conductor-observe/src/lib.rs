//! Observability setup shared by Conductor binaries.

pub mod tracing_setup;
