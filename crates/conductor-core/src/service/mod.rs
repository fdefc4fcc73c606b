//! Business logic services (use cases).
//!
//! Services depend on repository traits, never on concrete storage.

pub mod definition;
pub mod hash;
