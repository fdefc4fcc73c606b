//! External-call proxy port.

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A call to another service, addressed by method id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub method_id: String,
    pub params: Value,
    /// Forwarded so the callee can deduplicate replays of the same attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// What the callee answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub success: bool,
    pub status_code: u16,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceResponse {
    pub fn ok(payload: Value) -> Self {
        Self {
            success: true,
            status_code: 200,
            payload,
            error: None,
        }
    }

    pub fn failed(status_code: u16, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code,
            payload: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Server-side and throttling failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        !self.success && (self.status_code >= 500 || self.status_code == 429)
    }
}

/// Transport-level failures of the proxy itself.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("call timed out")]
    Timeout,

    #[error("unknown method: {0}")]
    UnknownMethod(String),
}

impl ProxyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProxyError::Unavailable(_) | ProxyError::Timeout)
    }
}

/// Invokes other services on behalf of steps.
pub trait ExternalCallProxy: Send + Sync {
    fn invoke(
        &self,
        call: &ServiceCall,
    ) -> impl Future<Output = Result<ServiceResponse, ProxyError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ServiceResponse::failed(503, "down").is_retryable());
        assert!(ServiceResponse::failed(429, "slow down").is_retryable());
        assert!(!ServiceResponse::failed(400, "bad").is_retryable());
        assert!(!ServiceResponse::ok(Value::Null).is_retryable());
        assert!(ProxyError::Timeout.is_retryable());
        assert!(!ProxyError::UnknownMethod("x".into()).is_retryable());
    }
}
