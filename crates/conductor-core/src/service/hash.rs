//! BodyHasher trait for idempotency body hashes.
//!
//! Defined in conductor-core so the engine can fingerprint request bodies
//! without coupling to a specific hashing algorithm. The
//! `Sha256BodyHasher` adapter lives in conductor-infra.

use serde_json::Value;

/// Abstraction over request-body hashing.
pub trait BodyHasher: Send + Sync {
    /// Compute a hex-encoded hash of the given content.
    fn compute_hash(&self, content: &str) -> String;

    /// Hash a JSON value in canonical form.
    fn hash_value(&self, value: &Value) -> String {
        self.compute_hash(&canonical_json(value))
    }
}

/// Serialize with object keys sorted at every level, so equal values hash equally
/// regardless of construction order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
