//! JEXL expression evaluator for switch `when` clauses.
//!
//! Wraps `jexl_eval::Evaluator` with a small set of string and collection
//! transforms. Node outputs are always passed as the evaluation context, never
//! interpolated into expression strings.

use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

/// JEXL evaluator with the standard transforms registered.
///
/// Expressions see the activity context of the switch node, e.g.
/// `nodes.classify.label|lower == 'urgent'` or `inputs.items|length > 3`.
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

/// String argument at `index`; anything else reads as empty.
fn text(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(Value::as_str).unwrap_or("")
}

/// Membership test: substring for strings, element equality for arrays.
fn contains(args: &[Value]) -> bool {
    match (args.first(), args.get(1)) {
        (Some(Value::String(subject)), Some(Value::String(needle))) => subject.contains(needle.as_str()),
        (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
        _ => false,
    }
}

/// Characters for strings, elements for arrays, keys for objects.
fn length(args: &[Value]) -> usize {
    match args.first() {
        Some(Value::String(s)) => s.chars().count(),
        Some(Value::Array(items)) => items.len(),
        Some(Value::Object(map)) => map.len(),
        _ => 0,
    }
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| Ok(json!(text(args, 0).to_lowercase())))
            .with_transform("upper", |args: &[Value]| Ok(json!(text(args, 0).to_uppercase())))
            .with_transform("trim", |args: &[Value]| Ok(json!(text(args, 0).trim())))
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(text(args, 0).starts_with(text(args, 1))))
            })
            .with_transform("contains", |args: &[Value]| Ok(json!(contains(args))))
            .with_transform("length", |args: &[Value]| Ok(json!(length(args) as f64)))
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!args.first().is_some_and(value_to_bool)))
            });

        Self { evaluator }
    }

    /// Evaluate an expression and coerce the result with JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context)
            .map(|result| value_to_bool(&result))
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
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Coerce a JSON value to boolean.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Value {
        json!({
            "inputs": { "priority": "HIGH", "tags": ["infra", "db"] },
            "nodes": { "classify": { "label": "urgent", "score": 0.92 } }
        })
    }

    #[test]
    fn comparisons_against_node_outputs() {
        let eval = ExpressionEvaluator::new();
        assert!(eval.evaluate_bool("nodes.classify.label == 'urgent'", &ctx()).unwrap());
        assert!(eval.evaluate_bool("nodes.classify.score > 0.9", &ctx()).unwrap());
        assert!(!eval.evaluate_bool("nodes.classify.score > 0.95", &ctx()).unwrap());
    }

    #[test]
    fn transforms() {
        let eval = ExpressionEvaluator::new();
        assert!(eval.evaluate_bool("inputs.priority|lower == 'high'", &ctx()).unwrap());
        assert!(eval.evaluate_bool("inputs.tags|length == 2", &ctx()).unwrap());
        assert!(eval.evaluate_bool("inputs.tags|contains('db')", &ctx()).unwrap());
        assert!(eval.evaluate_bool("nodes.missing|not", &ctx()).unwrap());
    }

    #[test]
    fn non_object_context_rejected() {
        let eval = ExpressionEvaluator::new();
        let err = eval.evaluate_bool("true", &json!([1])).unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidContext(_)));
    }

    #[test]
    fn length_counts_characters_and_keys() {
        let eval = ExpressionEvaluator::new();
        let context = json!({ "word": "héllo", "map": { "a": 1, "b": 2 } });
        assert!(eval.evaluate_bool("word|length == 5", &context).unwrap());
        assert!(eval.evaluate_bool("map|length == 2", &context).unwrap());
        assert!(eval.evaluate_bool("word|contains('ll')", &context).unwrap());
    }

    #[test]
    fn truthiness() {
        assert!(!value_to_bool(&Value::Null));
        assert!(!value_to_bool(&json!("")));
        assert!(!value_to_bool(&json!(0)));
        assert!(value_to_bool(&json!([])));
        assert!(value_to_bool(&json!("x")));
    }
}
