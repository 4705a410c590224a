//! Turning sandbox output text into items.

use serde_json::Value;
use switchyard_types::error::StepError;
use switchyard_types::item::Item;

/// What a sandboxed snippet produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeOutput {
    pub value: Value,
    /// Diagnostic lines the snippet emitted besides its result.
    pub logs: Vec<String>,
}

/// Parse the JSON a snippet printed.
///
/// Strict parse first. Failing that, the first `[` or `{` that starts a
/// complete JSON document wins, so stray prints around the result are
/// tolerated. Scalars are not accepted as a result.
pub fn parse_output(text: &str) -> Result<Value, StepError> {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        if value.is_array() || value.is_object() {
            return Ok(value);
        }
    }

    for (start, c) in text.char_indices() {
        if c != '[' && c != '{' {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            return Ok(value);
        }
    }

    let preview: String = text.trim().chars().take(120).collect();
    Err(StepError::execution(format!(
        "code output is not a JSON array or object: {preview:?}"
    )))
}

/// An array yields one item per element, an object a single item.
///
/// Elements shaped like items (`payload` plus optional `tags`, nothing
/// else) are taken as-is; anything else becomes a new item's payload.
pub fn into_items(value: Value) -> Vec<Item> {
    match value {
        Value::Array(values) => values.into_iter().map(into_item).collect(),
        other => vec![into_item(other)],
    }
}

fn into_item(value: Value) -> Item {
    let item_shaped = value.as_object().is_some_and(|map| {
        map.contains_key("payload") && map.keys().all(|k| k == "payload" || k == "tags")
    });
    if item_shaped {
        if let Ok(item) = serde_json::from_value::<Item>(value.clone()) {
            return item;
        }
    }
    Item::new(value)
}

/// Serialized input handed to a snippet: `[{"payload": .., "tags": ..}, ..]`.
pub fn items_json(items: &[Item]) -> Result<String, StepError> {
    serde_json::to_string(items)
        .map_err(|e| StepError::execution(format!("failed to serialize input items: {e}")))
}
