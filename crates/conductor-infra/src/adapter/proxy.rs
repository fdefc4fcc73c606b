//! Local `ExternalCallProxy` that logs every call.
//!
//! Methods with a registered response get that response; everything else is
//! acknowledged with an echo of the call.

use dashmap::DashMap;
use serde_json::json;

use conductor_core::gateway::{ExternalCallProxy, ProxyError, ServiceCall, ServiceResponse};

#[derive(Default)]
pub struct LoggingCallProxy {
    responses: DashMap<String, ServiceResponse>,
}

impl LoggingCallProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call to `method_id` with `response`.
    pub fn with_response(self, method_id: impl Into<String>, response: ServiceResponse) -> Self {
        self.responses.insert(method_id.into(), response);
        self
    }
}

impl ExternalCallProxy for LoggingCallProxy {
    async fn invoke(&self, call: &ServiceCall) -> Result<ServiceResponse, ProxyError> {
        tracing::info!(
            method_id = %call.method_id,
            idempotency_key = call.idempotency_key.as_deref().unwrap_or("-"),
            "service call"
        );
        if let Some(response) = self.responses.get(&call.method_id) {
            return Ok(response.clone());
        }
        Ok(ServiceResponse::ok(json!({
            "method_id": call.method_id,
            "params": call.params,
            "acknowledged": true,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(method_id: &str) -> ServiceCall {
        ServiceCall {
            method_id: method_id.to_string(),
            params: json!({ "order_id": "A1" }),
            idempotency_key: Some("run:step:1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_unregistered_method_is_acknowledged() {
        let proxy = LoggingCallProxy::new();
        let response = proxy.invoke(&call("inventory.reserve")).await.unwrap();
        assert!(response.success);
        assert_eq!(response.payload["params"]["order_id"], "A1");
    }

    #[tokio::test]
    async fn test_registered_response_is_returned() {
        let proxy = LoggingCallProxy::new()
            .with_response("payment.refund", ServiceResponse::failed(503, "maintenance"));
        let response = proxy.invoke(&call("payment.refund")).await.unwrap();
        assert!(!response.success);
        assert!(response.is_retryable());
    }
}
