//! Idempotency key store trait.
//!
//! The only structure requiring atomic insert-if-absent across concurrent
//! callers. Implementations enforce uniqueness of (route, key, body_hash).

use std::future::Future;

use chrono::{DateTime, Utc};
use serde_json::Value;

use conductor_types::error::RepositoryError;
use conductor_types::idempotency::IdempotencyRecord;

pub trait IdempotencyRepository: Send + Sync {
    /// Insert an unanswered slot if none exists.
    ///
    /// Returns `true` when this call created the slot.
    fn try_reserve(
        &self,
        route: &str,
        key: &str,
        body_hash: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    fn get_slot(
        &self,
        route: &str,
        key: &str,
        body_hash: &str,
    ) -> impl Future<Output = Result<Option<IdempotencyRecord>, RepositoryError>> + Send;

    /// Re-stamp an unanswered slot reserved before `stale_before`.
    ///
    /// Returns `true` when the slot was taken over by this call.
    fn take_over(
        &self,
        route: &str,
        key: &str,
        body_hash: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Store the produced response into a reserved slot.
    fn complete_slot(
        &self,
        route: &str,
        key: &str,
        body_hash: &str,
        response: &Value,
        status_code: u16,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Drop an unanswered slot so the operation can be attempted again.
    fn release_slot(
        &self,
        route: &str,
        key: &str,
        body_hash: &str,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}
