//! JEXL expression evaluator for condition and while clauses.
//!
//! Wraps `jexl_eval::Evaluator` with standard transforms pre-registered and
//! provides boolean evaluation against a run's variable namespace.
//!
//! **Security note:** variable values are always passed as context objects,
//! NEVER interpolated into expression strings. `{{path}}` tokens inside an
//! expression are rewritten to bare path references before evaluation, so
//! `{{orders}}|length > 0` and `orders|length > 0` are equivalent.

use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with standard transforms registered.
///
/// Used for:
/// - Condition step branching (e.g. `orders|length > 0`)
/// - While loop conditions (e.g. `cursor.has_more`)
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    /// Create a new evaluator with all standard transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // String transforms
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
            // Boolean transforms
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            // String search transforms
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            // Length transform (works on strings, arrays, and objects)
            .with_transform("length", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                let len = match &val {
                    Value::String(s) => s.len(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean result.
    ///
    /// The `context` must be a JSON object. Results are coerced to boolean
    /// using JavaScript-like truthiness rules.
    pub fn evaluate_bool(
        &self,
        expression: &str,
        context: &Value,
    ) -> Result<bool, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        let rewritten = strip_tokens(expression);
        let result = self
            .evaluator
            .eval_in_context(&rewritten, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))?;

        Ok(truthy(&result))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrite `{{ path }}` tokens to bare path references.
fn strip_tokens(expression: &str) -> String {
    let mut out = String::with_capacity(expression.len());
    let mut rest = expression;
    while let Some(open) = rest.find("{{") {
        match rest[open + 2..].find("}}") {
            Some(close) => {
                out.push_str(&rest[..open]);
                out.push_str(rest[open + 2..open + 2 + close].trim());
                rest = &rest[open + 2 + close + 2..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

/// JavaScript-like truthiness coercion.
fn truthy(value: &Value) -> bool {
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

    fn ctx() -> Value {
        json!({
            "orders": [1, 2, 3],
            "status": "  ACTIVE  ",
            "count": 0,
            "cursor": { "has_more": true }
        })
    }

    #[test]
    fn test_comparison_expression() {
        let eval = ConditionEvaluator::new();
        assert!(eval.evaluate_bool("orders|length > 2", &ctx()).unwrap());
        assert!(!eval.evaluate_bool("orders|length > 5", &ctx()).unwrap());
    }

    #[test]
    fn test_token_syntax_equivalent_to_bare_paths() {
        let eval = ConditionEvaluator::new();
        assert!(
            eval.evaluate_bool("{{orders}}|length > 2", &ctx()).unwrap()
        );
        assert!(eval.evaluate_bool("{{cursor.has_more}}", &ctx()).unwrap());
    }

    #[test]
    fn test_truthiness_coercion() {
        let eval = ConditionEvaluator::new();
        // Zero is falsy, non-empty arrays are truthy
        assert!(!eval.evaluate_bool("count", &ctx()).unwrap());
        assert!(eval.evaluate_bool("orders", &ctx()).unwrap());
    }

    #[test]
    fn test_string_transforms() {
        let eval = ConditionEvaluator::new();
        assert!(
            eval.evaluate_bool("status|trim|lower == 'active'", &ctx())
                .unwrap()
        );
        assert!(
            eval.evaluate_bool("status|contains('ACT')", &ctx())
                .unwrap()
        );
    }

    #[test]
    fn test_not_transform() {
        let eval = ConditionEvaluator::new();
        assert!(eval.evaluate_bool("count|not", &ctx()).unwrap());
    }

    #[test]
    fn test_invalid_expression_is_error() {
        let eval = ConditionEvaluator::new();
        let result = eval.evaluate_bool("<<<invalid>>>", &ctx());
        assert!(result.is_err());
    }

    #[test]
    fn test_non_object_context_rejected() {
        let eval = ConditionEvaluator::new();
        let result = eval.evaluate_bool("true", &json!([1, 2]));
        assert!(result.is_err());
    }

    #[test]
    fn test_strip_tokens_rewrites_in_place() {
        assert_eq!(strip_tokens("{{a.b}} > 3"), "a.b > 3");
        assert_eq!(strip_tokens("{{ a }} && {{b}}"), "a && b");
        assert_eq!(strip_tokens("plain == 1"), "plain == 1");
    }
}
