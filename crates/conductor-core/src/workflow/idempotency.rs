//! Idempotency guard for side-effecting operations.
//!
//! `check_or_reserve` either hands back the response recorded by an earlier
//! execution, reserves the slot for the caller (who must later `record` or
//! `release` it), or reports that a concurrent caller holds the slot. The
//! store's atomic insert-if-absent is what keeps two concurrent duplicates
//! from both believing they are first.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use conductor_types::config::IdempotencyConfig;
use conductor_types::error::RepositoryError;
use conductor_types::idempotency::IdempotencyCheck;

use crate::repository::IdempotencyRepository;

/// Identifies one idempotency slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub route: String,
    pub key: String,
    pub body_hash: String,
}

impl SlotKey {
    pub fn new(route: impl Into<String>, key: impl Into<String>, body_hash: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            key: key.into(),
            body_hash: body_hash.into(),
        }
    }
}

pub struct IdempotencyGuard<S> {
    store: Arc<S>,
    config: IdempotencyConfig,
}

impl<S: IdempotencyRepository> IdempotencyGuard<S> {
    pub fn new(store: Arc<S>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    /// Look up the slot, reserving it when absent or abandoned.
    pub async fn check_or_reserve(&self, slot: &SlotKey) -> Result<IdempotencyCheck, RepositoryError> {
        let now = Utc::now();
        if self
            .store
            .try_reserve(&slot.route, &slot.key, &slot.body_hash, now)
            .await?
        {
            tracing::debug!(route = %slot.route, key = %slot.key, "idempotency slot reserved");
            return Ok(IdempotencyCheck::Reserved);
        }

        let Some(record) = self
            .store
            .get_slot(&slot.route, &slot.key, &slot.body_hash)
            .await?
        else {
            // Released between the insert attempt and the read.
            let reserved = self
                .store
                .try_reserve(&slot.route, &slot.key, &slot.body_hash, now)
                .await?;
            return Ok(if reserved {
                IdempotencyCheck::Reserved
            } else {
                IdempotencyCheck::InFlight { reserved_at: now }
            });
        };

        if let (Some(response), Some(status_code)) = (record.response, record.status_code) {
            tracing::debug!(route = %slot.route, key = %slot.key, status_code, "returning recorded response");
            return Ok(IdempotencyCheck::PriorResponse {
                response,
                status_code,
            });
        }

        let ttl = chrono::Duration::seconds(self.config.reservation_ttl_secs as i64);
        let stale_before = now - ttl;
        if record.reserved_at < stale_before
            && self
                .store
                .take_over(&slot.route, &slot.key, &slot.body_hash, stale_before, now)
                .await?
        {
            tracing::warn!(
                route = %slot.route,
                key = %slot.key,
                reserved_at = %record.reserved_at,
                "took over abandoned idempotency reservation"
            );
            return Ok(IdempotencyCheck::Reserved);
        }

        Ok(IdempotencyCheck::InFlight {
            reserved_at: record.reserved_at,
        })
    }

    /// Store the produced response into a slot this caller reserved.
    pub async fn record(
        &self,
        slot: &SlotKey,
        response: &Value,
        status_code: u16,
    ) -> Result<(), RepositoryError> {
        self.store
            .complete_slot(&slot.route, &slot.key, &slot.body_hash, response, status_code)
            .await
    }

    /// Give up a reservation so a later attempt can execute.
    pub async fn release(&self, slot: &SlotKey) -> Result<(), RepositoryError> {
        self.store
            .release_slot(&slot.route, &slot.key, &slot.body_hash)
            .await
    }

    /// Poll an in-flight slot until its owner records a response.
    ///
    /// Returns `None` when the poll timeout passes, or when the owner
    /// released the slot without answering.
    pub async fn await_response(&self, slot: &SlotKey) -> Result<Option<(Value, u16)>, RepositoryError> {
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.poll_timeout_ms);

        loop {
            match self
                .store
                .get_slot(&slot.route, &slot.key, &slot.body_hash)
                .await?
            {
                Some(record) => {
                    if let (Some(response), Some(code)) = (record.response, record.status_code) {
                        return Ok(Some((response, code)));
                    }
                }
                None => return Ok(None),
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(interval).await;
        }
    }
}
