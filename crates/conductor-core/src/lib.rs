//! Workflow engine logic and repository trait definitions for Conductor.
//!
//! This crate defines the "ports" (repository and gateway traits) that the
//! infrastructure layer implements. It depends only on `conductor-types`,
//! never on `conductor-infra` or any database/IO crate.

pub mod event;
pub mod gateway;
pub mod repository;
pub mod service;
pub mod workflow;

#[cfg(test)]
pub mod testing;
