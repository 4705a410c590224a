//! Merge step: combines the sequences arriving on `input1..inputN`.
//!
//! Modes:
//! - `append` -- concatenate sequences in port order
//! - `by_position` -- index-align, padding shorter sequences with `{}` items,
//!   and object-merge aligned payloads (later ports overwrite)
//! - `by_key` -- group by a field path; later ports overwrite fields, within
//!   one port the first-seen value is kept; items without the key are dropped
//! - `keep_first` / `keep_last` -- only the first or last port's sequence
//!
//! Ports are always combined in numeric port order, never arrival order, so
//! every mode is insensitive to which branch finished first.
//!
//! With `wait_for_all = false` the step runs once per arriving input and
//! forwards whatever it was given (pass-through), regardless of mode.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use switchyard_types::error::StepError;
use switchyard_types::item::{Item, MAIN_PORT, ParamBag, PortBundle};

use super::{param_bool, param_str, param_u64};
use crate::step::{ExecutionContext, PortSpec, StepDescriptor, StepHandler};

const DEFAULT_INPUTS: u64 = 2;
const MAX_INPUTS: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    Append,
    ByPosition,
    ByKey,
    KeepFirst,
    KeepLast,
}

impl MergeMode {
    fn from_params(params: &ParamBag) -> Result<Self, StepError> {
        match param_str(params, "mode")? {
            None => Ok(Self::Append),
            Some(raw) => serde_json::from_value(Value::String(raw.to_string()))
                .map_err(|_| StepError::validation(format!("unknown merge mode '{raw}'"))),
        }
    }
}

pub struct MergeStep {
    descriptor: StepDescriptor,
}

impl MergeStep {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor {
                inputs: input_names(DEFAULT_INPUTS)
                    .into_iter()
                    .map(PortSpec::required)
                    .collect(),
                ..StepDescriptor::simple("merge", "Merge")
            },
        }
    }
}

impl Default for MergeStep {
    fn default() -> Self {
        Self::new()
    }
}

fn input_count(params: &ParamBag) -> u64 {
    param_u64(params, "inputs")
        .ok()
        .flatten()
        .unwrap_or(DEFAULT_INPUTS)
        .clamp(1, MAX_INPUTS)
}

fn input_names(count: u64) -> Vec<String> {
    (1..=count).map(|i| format!("input{i}")).collect()
}

impl StepHandler for MergeStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    fn input_ports(&self, params: &ParamBag) -> Vec<PortSpec> {
        input_names(input_count(params))
            .into_iter()
            .map(PortSpec::required)
            .collect()
    }

    fn waits_for_all_inputs(&self, params: &ParamBag) -> bool {
        param_bool(params, "wait_for_all", true).unwrap_or(true)
    }

    async fn execute(
        &self,
        inputs: PortBundle,
        params: &ParamBag,
        ctx: &ExecutionContext,
    ) -> Result<PortBundle, StepError> {
        let mode = MergeMode::from_params(params)?;
        let ports = input_names(input_count(params));
        let sequences: Vec<&[Item]> = ports.iter().map(|p| inputs.get(p)).collect();

        let merged = if !StepHandler::waits_for_all_inputs(self, params) {
            append(&sequences)
        } else {
            match mode {
                MergeMode::Append => append(&sequences),
                MergeMode::ByPosition => by_position(&sequences),
                MergeMode::ByKey => {
                    let key = param_str(params, "key")?.ok_or_else(|| {
                        StepError::validation("by_key merge requires a 'key' parameter")
                    })?;
                    by_key(&sequences, key)
                }
                MergeMode::KeepFirst => sequences.first().map(|s| s.to_vec()).unwrap_or_default(),
                MergeMode::KeepLast => sequences.last().map(|s| s.to_vec()).unwrap_or_default(),
            }
        };

        ctx.logger().debug(&format!(
            "merged {} input item(s) into {} ({mode:?})",
            inputs.item_count(),
            merged.len()
        ));
        Ok(PortBundle::single(MAIN_PORT, merged))
    }
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

fn append(sequences: &[&[Item]]) -> Vec<Item> {
    sequences.iter().flat_map(|s| s.iter().cloned()).collect()
}

/// Object view of a payload; scalars and arrays land under `value`.
fn payload_fields(payload: &Value) -> Map<String, Value> {
    match payload {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    }
}

fn by_position(sequences: &[&[Item]]) -> Vec<Item> {
    let len = sequences.iter().map(|s| s.len()).max().unwrap_or(0);
    let padding = Item::empty();

    (0..len)
        .map(|index| {
            let mut payload = Map::new();
            let mut tags = Map::new();
            for seq in sequences {
                let item = seq.get(index).unwrap_or(&padding);
                payload.extend(payload_fields(&item.payload));
                tags.extend(item.tags.clone());
            }
            Item {
                payload: Value::Object(payload),
                tags,
            }
        })
        .collect()
}

/// Walk a dotted path (`customer.id`) into a payload.
fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(payload, |value, segment| value.get(segment))
        .filter(|v| !v.is_null())
}

struct KeyedEntry {
    payload: Map<String, Value>,
    tags: Map<String, Value>,
    /// Port index that last wrote each field.
    writers: HashMap<String, usize>,
}

fn by_key(sequences: &[&[Item]], key: &str) -> Vec<Item> {
    let mut order: Vec<String> = Vec::new();
    let mut entries: HashMap<String, KeyedEntry> = HashMap::new();

    for (port, seq) in sequences.iter().enumerate() {
        for item in seq.iter() {
            let Some(key_value) = lookup_path(&item.payload, key) else {
                continue;
            };
            let fingerprint = key_value.to_string();
            let entry = entries.entry(fingerprint.clone()).or_insert_with(|| {
                order.push(fingerprint);
                KeyedEntry {
                    payload: Map::new(),
                    tags: Map::new(),
                    writers: HashMap::new(),
                }
            });

            for (field, value) in payload_fields(&item.payload) {
                let overwrite = match entry.writers.get(&field) {
                    None => true,
                    Some(&writer) => writer < port,
                };
                if overwrite {
                    entry.writers.insert(field.clone(), port);
                    entry.payload.insert(field, value);
                }
            }
            for (tag, value) in &item.tags {
                entry.tags.entry(tag.clone()).or_insert_with(|| value.clone());
            }
        }
    }

    order
        .into_iter()
        .filter_map(|k| entries.remove(&k))
        .map(|e| Item {
            payload: Value::Object(e.payload),
            tags: e.tags,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn bag(value: Value) -> ParamBag {
        value.as_object().cloned().unwrap()
    }

    fn items(values: Vec<Value>) -> Vec<Item> {
        values.into_iter().map(Item::new).collect()
    }

    fn two_inputs(a: Vec<Value>, b: Vec<Value>) -> PortBundle {
        let mut bundle = PortBundle::new();
        bundle.insert("input1", items(a));
        bundle.insert("input2", items(b));
        bundle
    }

    async fn run(params: Value, inputs: PortBundle) -> Vec<Value> {
        let ctx = ExecutionContext::standalone("merge");
        MergeStep::new()
            .execute(inputs, &bag(params), &ctx)
            .await
            .unwrap()
            .get(MAIN_PORT)
            .iter()
            .map(|i| i.payload.clone())
            .collect()
    }

    #[tokio::test]
    async fn append_follows_port_order() {
        let out = run(
            json!({"mode": "append"}),
            two_inputs(vec![json!({"a": 1}), json!({"a": 2})], vec![json!({"b": 1})]),
        )
        .await;
        assert_eq!(out, vec![json!({"a": 1}), json!({"a": 2}), json!({"b": 1})]);
    }

    #[tokio::test]
    async fn append_is_independent_of_bundle_construction_order() {
        let mut reversed = PortBundle::new();
        reversed.insert("input2", items(vec![json!({"b": 1})]));
        reversed.insert("input1", items(vec![json!({"a": 1})]));
        let forward = two_inputs(vec![json!({"a": 1})], vec![json!({"b": 1})]);

        assert_eq!(
            run(json!({}), reversed).await,
            run(json!({}), forward).await
        );
    }

    #[tokio::test]
    async fn by_position_pads_shorter_sequence() {
        let out = run(
            json!({"mode": "by_position"}),
            two_inputs(
                vec![json!({"a": 1}), json!({"a": 2})],
                vec![json!({"b": 1}), json!({"b": 2}), json!({"b": 3})],
            ),
        )
        .await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], json!({"a": 1, "b": 1}));
        assert_eq!(out[1], json!({"a": 2, "b": 2}));
        // Third item carries only the longer port's fields.
        assert_eq!(out[2], json!({"b": 3}));
    }

    #[tokio::test]
    async fn by_position_later_port_overwrites() {
        let out = run(
            json!({"mode": "by_position"}),
            two_inputs(vec![json!({"k": "left", "x": 1})], vec![json!({"k": "right"})]),
        )
        .await;
        assert_eq!(out, vec![json!({"k": "right", "x": 1})]);
    }

    #[tokio::test]
    async fn by_key_groups_and_drops_keyless() {
        let out = run(
            json!({"mode": "by_key", "key": "customer.id"}),
            two_inputs(
                vec![
                    json!({"customer": {"id": 1}, "name": "Ada"}),
                    json!({"customer": {"id": 2}, "name": "Lin"}),
                    json!({"name": "no key"}),
                ],
                vec![
                    json!({"customer": {"id": 2}, "orders": 4}),
                    json!({"customer": {"id": 1}, "name": "Ada L.", "orders": 7}),
                ],
            ),
        )
        .await;
        assert_eq!(
            out,
            vec![
                json!({"customer": {"id": 1}, "name": "Ada L.", "orders": 7}),
                json!({"customer": {"id": 2}, "name": "Lin", "orders": 4}),
            ]
        );
    }

    #[tokio::test]
    async fn by_key_first_seen_wins_within_one_port() {
        let out = run(
            json!({"mode": "by_key", "key": "id"}),
            two_inputs(
                vec![json!({"id": "x", "v": 1}), json!({"id": "x", "v": 2, "w": true})],
                vec![],
            ),
        )
        .await;
        assert_eq!(out, vec![json!({"id": "x", "v": 1, "w": true})]);
    }

    #[tokio::test]
    async fn by_key_requires_key() {
        let ctx = ExecutionContext::standalone("merge");
        let err = MergeStep::new()
            .execute(two_inputs(vec![], vec![]), &bag(json!({"mode": "by_key"})), &ctx)
            .await
            .unwrap_err();
        assert!(err.message.contains("key"));
    }

    #[tokio::test]
    async fn keep_first_and_last() {
        let inputs = || two_inputs(vec![json!(1)], vec![json!(2), json!(3)]);
        assert_eq!(run(json!({"mode": "keep_first"}), inputs()).await, vec![json!(1)]);
        assert_eq!(
            run(json!({"mode": "keep_last"}), inputs()).await,
            vec![json!(2), json!(3)]
        );
    }

    #[tokio::test]
    async fn three_inputs_use_numeric_port_order() {
        let mut bundle = two_inputs(vec![json!("a")], vec![json!("b")]);
        bundle.insert("input3", items(vec![json!("c")]));
        let out = run(json!({"inputs": 3}), bundle).await;
        assert_eq!(out, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn ports_follow_inputs_parameter() {
        let step = MergeStep::new();
        let ports: Vec<String> = StepHandler::input_ports(&step, &bag(json!({"inputs": 3})))
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(ports, vec!["input1", "input2", "input3"]);
        assert!(!StepHandler::waits_for_all_inputs(
            &step,
            &bag(json!({"wait_for_all": false}))
        ));
    }

    #[test]
    fn unknown_mode_rejected() {
        assert!(MergeMode::from_params(&bag(json!({"mode": "zip"}))).is_err());
        assert_eq!(
            MergeMode::from_params(&bag(json!({"mode": "by_position"}))).unwrap(),
            MergeMode::ByPosition
        );
    }
}
