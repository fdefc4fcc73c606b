//! SHA-256 request-body hashing.
//!
//! Implements the `BodyHasher` trait from `conductor-core` using the `sha2`
//! crate (RustCrypto ecosystem).

use sha2::{Digest, Sha256};

use conductor_core::service::hash::BodyHasher;

/// Lowercase hex SHA-256 of the canonical request body.
pub struct Sha256BodyHasher;

impl Sha256BodyHasher {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Sha256BodyHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl BodyHasher for Sha256BodyHasher {
    fn compute_hash(&self, content: &str) -> String {
        let digest = Sha256::digest(content.as_bytes());
        format!("{:x}", digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sha256_hash_known_value() {
        let hash = Sha256BodyHasher::new().compute_hash("");
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_key_order_does_not_change_hash() {
        let hasher = Sha256BodyHasher::new();
        let a = json!({ "code": "OrderFulfillment", "input": { "orderId": "A1", "total": 40 } });
        let b = json!({ "input": { "total": 40, "orderId": "A1" }, "code": "OrderFulfillment" });
        assert_eq!(hasher.hash_value(&a), hasher.hash_value(&b));
        assert_ne!(
            hasher.hash_value(&a),
            hasher.hash_value(&json!({ "code": "OrderFulfillment" }))
        );
    }
}
