//! Infrastructure layer for Conductor.
//!
//! Contains implementations of the ports defined in `conductor-core`:
//! SQLite storage, TOML configuration loading, SHA-256 body hashing, and
//! in-process collaborator adapters wired to the integration event bus.

pub mod adapter;
pub mod config;
pub mod crypto;
pub mod sqlite;
