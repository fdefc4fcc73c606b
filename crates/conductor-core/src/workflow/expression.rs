//! JEXL expression evaluator for branch conditions.
//!
//! Wraps `jexl_eval::Evaluator` with a small set of transforms. Conditions
//! are evaluated against the run context object; context values are always
//! passed as the evaluation context, never interpolated into expressions.

use serde_json::{json, Value};

use conductor_types::dsl::BranchRule;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression '{expression}' failed: {reason}")]
    EvalFailed { expression: String, reason: String },

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// WorkflowEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with standard transforms registered.
pub struct WorkflowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl WorkflowEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            });

        Self { evaluator }
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: expression.to_string(),
                reason: e.to_string(),
            })
    }

    /// Evaluate an expression and coerce the result with JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context)
            .map(|v| value_to_bool(&v))
    }

    /// The first rule whose condition holds, in declaration order.
    pub fn first_match<'r>(
        &self,
        rules: &'r [BranchRule],
        context: &Value,
    ) -> Result<Option<&'r BranchRule>, ExpressionError> {
        for rule in rules {
            if self.evaluate_bool(&rule.when, context)? {
                return Ok(Some(rule));
            }
        }
        Ok(None)
    }
}

impl Default for WorkflowEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(when: &str, to: &str) -> BranchRule {
        BranchRule {
            when: when.to_string(),
            to: to.to_string(),
        }
    }

    #[test]
    fn test_comparison_against_context() {
        let eval = WorkflowEvaluator::new();
        let ctx = json!({ "order": { "total": 250, "country": "NL" } });
        assert!(eval.evaluate_bool("order.total > 100", &ctx).unwrap());
        assert!(!eval.evaluate_bool("order.country == 'DE'", &ctx).unwrap());
    }

    #[test]
    fn test_boolean_operators() {
        let eval = WorkflowEvaluator::new();
        let ctx = json!({ "kyc": "passed", "score": 720 });
        assert!(eval
            .evaluate_bool("kyc == 'passed' && score >= 700", &ctx)
            .unwrap());
        assert!(eval
            .evaluate_bool("kyc == 'failed' || score >= 700", &ctx)
            .unwrap());
    }

    #[test]
    fn test_transforms() {
        let eval = WorkflowEvaluator::new();
        let ctx = json!({ "tier": "GOLD", "items": [1, 2, 3], "note": " hi " });
        assert_eq!(eval.evaluate_value("tier|lower", &ctx).unwrap(), json!("gold"));
        assert_eq!(eval.evaluate_value("items|length", &ctx).unwrap(), json!(3.0));
        assert_eq!(eval.evaluate_value("note|trim", &ctx).unwrap(), json!("hi"));
        assert!(eval.evaluate_bool("tier|contains('OL')", &ctx).unwrap());
    }

    #[test]
    fn test_truthiness() {
        assert!(!value_to_bool(&Value::Null));
        assert!(!value_to_bool(&json!(0)));
        assert!(!value_to_bool(&json!("")));
        assert!(value_to_bool(&json!("x")));
        assert!(value_to_bool(&json!([])));
    }

    #[test]
    fn test_first_match_wins() {
        let eval = WorkflowEvaluator::new();
        let rules = vec![
            rule("amount > 1000", "manual-review"),
            rule("amount > 100", "fast-review"),
            rule("amount > 10", "auto-approve"),
        ];
        let ctx = json!({ "amount": 500 });
        let matched = eval.first_match(&rules, &ctx).unwrap().unwrap();
        assert_eq!(matched.to, "fast-review");

        let none = eval.first_match(&rules, &json!({ "amount": 5 })).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_non_object_context_rejected() {
        let eval = WorkflowEvaluator::new();
        let result = eval.evaluate_bool("true", &json!([1]));
        assert!(matches!(result, Err(ExpressionError::InvalidContext(_))));
    }
}
