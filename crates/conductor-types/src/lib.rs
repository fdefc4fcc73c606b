//! Shared domain types for Conductor.
//!
//! Definitions and their versioned DSL, run state, step history, signals,
//! idempotency records, integration events, and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod definition;
pub mod dsl;
pub mod error;
pub mod event;
pub mod idempotency;
pub mod run;
