//! Item envelope and per-port item sequences.
//!
//! An [`Item`] is the unit of data flowing along a connection. A
//! [`PortBundle`] maps port names to ordered item sequences and is both the
//! input and the output shape of every step.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Port name used when a step or connection does not name one.
pub const MAIN_PORT: &str = "main";

/// Free-form parameter bag attached to a step.
pub type ParamBag = Map<String, Value>;

/// One unit of data: a JSON payload plus arbitrary tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub tags: Map<String, Value>,
}

impl Item {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            tags: Map::new(),
        }
    }

    /// An item whose payload is `{}`.
    pub fn empty() -> Self {
        Self::new(Value::Object(Map::new()))
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: Value) -> Self {
        self.tags.insert(key.into(), value);
        self
    }

    /// Error-shaped item emitted in place of a failure when a step is
    /// configured to continue on failure.
    pub fn error(kind: &str, message: &str) -> Self {
        Self::new(serde_json::json!({
            "error": { "kind": kind, "message": message }
        }))
    }

    /// Payload as a JSON object, if it is one.
    pub fn payload_object(&self) -> Option<&Map<String, Value>> {
        self.payload.as_object()
    }
}

impl Default for Item {
    fn default() -> Self {
        Self::empty()
    }
}

/// Named mapping from port to ordered item sequence.
///
/// Ports iterate in name order. Item order within a port is significant and
/// is preserved by every operation here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortBundle(BTreeMap<String, Vec<Item>>);

impl PortBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bundle carrying `items` on a single port.
    pub fn single(port: impl Into<String>, items: Vec<Item>) -> Self {
        let mut bundle = Self::new();
        bundle.insert(port, items);
        bundle
    }

    /// Items on `port`; an absent port reads as an empty sequence.
    pub fn get(&self, port: &str) -> &[Item] {
        self.0.get(port).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains_port(&self, port: &str) -> bool {
        self.0.contains_key(port)
    }

    /// Replace the sequence on `port`.
    pub fn insert(&mut self, port: impl Into<String>, items: Vec<Item>) {
        self.0.insert(port.into(), items);
    }

    /// Append `items` to whatever `port` already holds.
    pub fn extend_port(&mut self, port: impl Into<String>, items: impl IntoIterator<Item = Item>) {
        self.0.entry(port.into()).or_default().extend(items);
    }

    /// Append every port of `other` onto this bundle.
    pub fn absorb(&mut self, other: PortBundle) {
        for (port, items) in other.0 {
            self.extend_port(port, items);
        }
    }

    pub fn take(&mut self, port: &str) -> Vec<Item> {
        self.0.remove(port).unwrap_or_default()
    }

    pub fn ports(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Item])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// True when no port carries any item.
    pub fn has_no_items(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    pub fn item_count(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn into_inner(self) -> BTreeMap<String, Vec<Item>> {
        self.0
    }
}

impl From<BTreeMap<String, Vec<Item>>> for PortBundle {
    fn from(map: BTreeMap<String, Vec<Item>>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_port_reads_as_empty() {
        let bundle = PortBundle::single("main", vec![Item::new(json!(1))]);
        assert_eq!(bundle.get("main").len(), 1);
        assert!(bundle.get("other").is_empty());
    }

    #[test]
    fn extend_port_preserves_order() {
        let mut bundle = PortBundle::new();
        bundle.extend_port("main", vec![Item::new(json!(1)), Item::new(json!(2))]);
        bundle.extend_port("main", vec![Item::new(json!(3))]);
        let values: Vec<_> = bundle.get("main").iter().map(|i| i.payload.clone()).collect();
        assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn has_no_items_ignores_empty_ports() {
        let mut bundle = PortBundle::new();
        bundle.insert("true", vec![]);
        bundle.insert("false", vec![]);
        assert!(bundle.has_no_items());
        bundle.extend_port("false", vec![Item::empty()]);
        assert!(!bundle.has_no_items());
        assert_eq!(bundle.item_count(), 1);
    }

    #[test]
    fn bundle_serializes_as_port_map() {
        let bundle = PortBundle::single(
            "main",
            vec![Item::new(json!({"a": 1})).with_tag("source", json!("webhook"))],
        );
        let value = serde_json::to_value(&bundle).unwrap();
        assert_eq!(
            value,
            json!({"main": [{"payload": {"a": 1}, "tags": {"source": "webhook"}}]})
        );
    }

    #[test]
    fn item_without_tags_deserializes() {
        let item: Item = serde_json::from_value(json!({"payload": [1, 2]})).unwrap();
        assert!(item.tags.is_empty());
        assert_eq!(item.payload, json!([1, 2]));
    }

    #[test]
    fn error_item_shape() {
        let item = Item::error("timeout", "took too long");
        assert_eq!(item.payload["error"]["kind"], "timeout");
        assert_eq!(item.payload["error"]["message"], "took too long");
    }
}
