//! Workflow engine core.
//!
//! - `definition` -- DSL parsing, validation and file loading
//! - `context` -- run context, templates and size limits
//! - `expression` -- JEXL evaluator for branch conditions
//! - `handler` / `handlers` -- one handler per step type
//! - `interpreter` -- durable step-by-step execution
//! - `compensation` -- reverse-order undo of completed steps
//! - `signal` -- delivery of named signals to Waiting runs
//! - `idempotency` -- keyed at-most-once command execution
//! - `engine` -- public entry points that tie the above together
//! - `sweeper` -- deadlines, aged waits and orphaned-run recovery
//! - `bridge` -- integration events to starts and signals

pub mod bridge;
pub mod compensation;
pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod expression;
pub mod handler;
pub mod handlers;
pub mod idempotency;
pub mod interpreter;
pub mod retry;
pub mod signal;
pub mod sweeper;
