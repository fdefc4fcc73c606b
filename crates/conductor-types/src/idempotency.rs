//! Idempotency slots keyed by (route, key, body hash).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Route used for idempotent workflow starts.
pub const START_ROUTE: &str = "workflow.start";

/// A reserved or answered idempotency slot.
///
/// `response` is `None` while the reserving caller is still executing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub route: String,
    pub key: String,
    pub body_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub reserved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl IdempotencyRecord {
    pub fn is_answered(&self) -> bool {
        self.response.is_some()
    }
}

/// Result of checking a slot before a side-effecting operation.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyCheck {
    /// The operation already ran; reuse its response.
    PriorResponse { response: Value, status_code: u16 },
    /// The caller owns the slot and must record or release it.
    Reserved,
    /// Another caller holds a live reservation without a response yet.
    InFlight { reserved_at: DateTime<Utc> },
}
