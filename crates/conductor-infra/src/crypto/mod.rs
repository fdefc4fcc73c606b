//! Hashing for idempotency slots.

pub mod hash;
