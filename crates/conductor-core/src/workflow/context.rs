//! Run context data bag with merge, path lookup, and template resolution.
//!
//! `RunContext` is the mutable state a run carries between steps. It is a
//! JSON object: step outputs and signal payloads are merged into it with
//! key-overwrite semantics, and step configs reference it through
//! `{{ dotted.path }}` templates.

use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum serialized size of a run context (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

/// Context key holding the payloads of all accepted signals, by signal name.
pub const SIGNALS_KEY: &str = "signals";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context size ({size} bytes) exceeds maximum ({max} bytes)")]
    TooLarge { size: usize, max: usize },
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// The data bag of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunContext {
    data: Map<String, Value>,
}

impl RunContext {
    /// Wrap a stored context. Non-object values are kept under `input`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(data) => Self { data },
            Value::Null => Self::default(),
            other => {
                let mut data = Map::new();
                data.insert("input".to_string(), other);
                Self { data }
            }
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.data)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Shallow merge: every top-level key of `patch` overwrites ours.
    /// A non-object patch is ignored.
    pub fn merge(&mut self, patch: &Value) {
        if let Value::Object(fields) = patch {
            for (key, value) in fields {
                self.data.insert(key.clone(), value.clone());
            }
        }
    }

    /// Merge a signal payload and keep a copy under `signals.<name>`.
    pub fn apply_signal(&mut self, name: &str, payload: &Value) {
        self.merge(payload);
        let signals = self
            .data
            .entry(SIGNALS_KEY.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !signals.is_object() {
            *signals = Value::Object(Map::new());
        }
        if let Value::Object(map) = signals {
            map.insert(name.to_string(), payload.clone());
        }
    }

    /// Look up a dotted path (`order.items.0.sku`). Numeric segments index arrays.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.data.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Replace every `{{ path }}` in `template` with the value at `path`.
    ///
    /// Unknown references are left as-is (not an error).
    pub fn resolve_template(&self, template: &str) -> String {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start..].find("}}") else {
                break;
            };
            let end = start + len + 2;
            let path = rest[start + 2..end - 2].trim();

            result.push_str(&rest[..start]);
            match self.lookup(path) {
                Some(value) => result.push_str(&value_to_string(value)),
                None => result.push_str(&rest[start..end]),
            }
            rest = &rest[end..];
        }

        result.push_str(rest);
        result
    }

    /// Render templates inside a JSON value.
    ///
    /// A string that is exactly one `{{ path }}` is replaced by the raw value
    /// at `path`, preserving its JSON type. Other strings are resolved as
    /// text templates. Objects and arrays are rendered recursively.
    pub fn render(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => {
                let trimmed = s.trim();
                if let Some(inner) = trimmed
                    .strip_prefix("{{")
                    .and_then(|t| t.strip_suffix("}}"))
                {
                    if !inner.contains("{{") {
                        if let Some(found) = self.lookup(inner.trim()) {
                            return found.clone();
                        }
                    }
                }
                Value::String(self.resolve_template(s))
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.render(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// The output context: the listed keys, or everything when `keys` is empty.
    pub fn select_output(&self, keys: &[String]) -> Value {
        if keys.is_empty() {
            return Value::Object(self.data.clone());
        }
        let selected = keys
            .iter()
            .filter_map(|k| self.data.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        Value::Object(selected)
    }

    /// Serialized size in bytes.
    pub fn total_size(&self) -> usize {
        serde_json::to_string(&self.data)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn check_size(&self) -> Result<(), ContextError> {
        let size = self.total_size();
        if size > MAX_CONTEXT_SIZE {
            return Err(ContextError::TooLarge {
                size,
                max: MAX_CONTEXT_SIZE,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Convert a JSON value to a display string for template resolution.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
