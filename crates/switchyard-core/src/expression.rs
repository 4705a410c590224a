//! JEXL expression evaluation for rule-driven steps (`if`, `switch`).
//!
//! Item data is always passed in as the evaluation context, never spliced
//! into the expression text.

use serde_json::{Map, Value, json};
use switchyard_types::item::Item;

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(Value::as_str).unwrap_or("")
}

/// JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// JEXL evaluator with the standard string and collection transforms.
///
/// The underlying transforms are not `Send`; build one where it is used and
/// drop it before the next `.await`.
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| Ok(json!(str_arg(args, 0).to_lowercase())))
            .with_transform("upper", |args: &[Value]| Ok(json!(str_arg(args, 0).to_uppercase())))
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("split", |args: &[Value]| {
                let delimiter = args.get(1).and_then(Value::as_str).unwrap_or(",");
                let parts: Vec<&str> = str_arg(args, 0).split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match args.first() {
                    Some(Value::Array(values)) => {
                        values.contains(args.get(1).unwrap_or(&Value::Null))
                    }
                    _ => str_arg(args, 0).contains(str_arg(args, 1)),
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!truthy(args.first().unwrap_or(&Value::Null))))
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
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<&String> = match args.first() {
                    Some(Value::Object(o)) => o.keys().collect(),
                    _ => Vec::new(),
                };
                Ok(json!(keys))
            });

        Self { evaluator }
    }

    /// Evaluate to a raw JSON value. `context` must be an object.
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

    /// Evaluate and coerce the result with [`truthy`].
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context).map(|v| truthy(&v))
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Context an item-level rule sees: `item`, `tags`, `index`.
pub fn item_context(item: &Item, index: usize) -> Value {
    let mut ctx = Map::new();
    ctx.insert("item".to_string(), item.payload.clone());
    ctx.insert("tags".to_string(), Value::Object(item.tags.clone()));
    ctx.insert("index".to_string(), json!(index));
    Value::Object(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval() -> ExpressionEvaluator {
        ExpressionEvaluator::new()
    }

    #[test]
    fn nested_field_comparison() {
        let ctx = json!({"item": {"order": {"total": 120}}});
        assert!(eval().evaluate_bool("item.order.total > 100", &ctx).unwrap());
        assert!(!eval().evaluate_bool("item.order.total > 500", &ctx).unwrap());
    }

    #[test]
    fn boolean_operators() {
        let ctx = json!({"item": {"a": true, "b": false}});
        assert!(eval().evaluate_bool("item.a || item.b", &ctx).unwrap());
        assert!(!eval().evaluate_bool("item.a && item.b", &ctx).unwrap());
    }

    #[test]
    fn string_transforms() {
        let ctx = json!({"item": {"name": "  Ada  "}});
        let value = eval().evaluate_value("item.name|trim|lower", &ctx).unwrap();
        assert_eq!(value, json!("ada"));
        assert!(eval()
            .evaluate_bool("item.name|trim|startsWith('A')", &ctx)
            .unwrap());
    }

    #[test]
    fn contains_on_arrays_and_strings() {
        let ctx = json!({"item": {"labels": ["bug", "p1"], "title": "crash on start"}});
        assert!(eval().evaluate_bool("item.labels|contains('p1')", &ctx).unwrap());
        assert!(eval().evaluate_bool("item.title|contains('crash')", &ctx).unwrap());
        assert!(!eval().evaluate_bool("item.labels|contains('p2')", &ctx).unwrap());
    }

    #[test]
    fn length_counts_chars() {
        let ctx = json!({"item": {"s": "héllo", "xs": [1, 2, 3]}});
        assert_eq!(eval().evaluate_value("item.s|length", &ctx).unwrap(), json!(5.0));
        assert!(eval().evaluate_bool("item.xs|length == 3", &ctx).unwrap());
    }

    #[test]
    fn missing_field_is_falsy() {
        let ctx = json!({"item": {}});
        assert!(!eval().evaluate_bool("item.missing", &ctx).unwrap());
    }

    #[test]
    fn non_object_context_rejected() {
        let err = eval().evaluate_bool("true", &json!([1])).unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidContext(_)));
    }

    #[test]
    fn item_context_shape() {
        let item = Item::new(json!({"n": 1})).with_tag("src", json!("x"));
        let ctx = item_context(&item, 4);
        assert_eq!(ctx["item"]["n"], json!(1));
        assert_eq!(ctx["tags"]["src"], json!("x"));
        assert_eq!(ctx["index"], json!(4));
    }

    #[test]
    fn truthiness() {
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!([])));
        assert!(!truthy(&Value::Null));
    }
}
