//! The variable pool: a hierarchical, namespaced key/value store shared by
//! every node in a run.
//!
//! Keys are `(node_id, key_path)` pairs; `node_id` may be an ordinary
//! node's id or one of the reserved pseudo-node-ids `sys`, `env`, `conv`.
//! Writing a nested object appends each intermediate key recursively,
//! mirroring the original platform's `variable_utils.append_variables_recursively`.

use serde_json::{Map, Value};
use std::collections::HashMap;

/// Reserved namespace holding system variables (`files`, `user_id`, `app_id`, …).
pub const SYS: &str = "sys";
/// Reserved namespace holding environment variables.
pub const ENV: &str = "env";
/// Reserved namespace holding conversation variables (empty for non-chat workflows).
pub const CONV: &str = "conv";

/// A nested key path into one node's namespace, e.g. `["text"]` or
/// `["outputs", "result"]`.
pub type KeyPath = Vec<String>;

/// The hierarchical store. Internally a two-level map: `node_id -> (key ->
/// value)`, where `value` may itself be a nested `Value::Object` that a
/// selector indexes further.
#[derive(Debug, Clone, Default)]
pub struct VariablePool {
    namespaces: HashMap<String, Map<String, Value>>,
}

impl VariablePool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the three reserved namespaces from caller-supplied data.
    pub fn with_system_variables(
        sys: Map<String, Value>,
        env: Map<String, Value>,
        conv: Map<String, Value>,
    ) -> Self {
        let mut pool = Self::new();
        pool.namespaces.insert(SYS.to_string(), sys);
        pool.namespaces.insert(ENV.to_string(), env);
        pool.namespaces.insert(CONV.to_string(), conv);
        pool
    }

    /// Write a single, non-nested value at `(node_id, key_path)`,
    /// overwriting whatever was there. Used for scalar bookkeeping writes
    /// like `error_message`/`error_type` (`SPEC_FULL.md` §4.4).
    pub fn add(&mut self, node_id: &str, key_path: &[String], value: Value) {
        self.append_recursive(node_id, key_path, value);
    }

    /// Recursively append `value` under `(node_id, key_path)`. If `value`
    /// is itself an object, each of its keys is appended as its own
    /// nested write rather than replacing the whole subtree — this is
    /// what lets two different node outputs targeting overlapping nested
    /// keys merge instead of clobbering each other.
    pub fn append_recursive(&mut self, node_id: &str, key_path: &[String], value: Value) {
        let Some((head, rest)) = key_path.split_first() else {
            return;
        };
        let namespace = self.namespaces.entry(node_id.to_string()).or_default();

        if rest.is_empty() {
            match value {
                Value::Object(nested) => {
                    let slot = namespace
                        .entry(head.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    merge_object(slot, nested);
                }
                other => {
                    namespace.insert(head.clone(), other);
                }
            }
            return;
        }

        let slot = namespace
            .entry(head.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        append_nested(slot, rest, value);
    }

    /// Read a value by its full selector `[node_id, key, sub_key, ...]`.
    pub fn get(&self, node_id: &str, key_path: &[String]) -> Option<&Value> {
        let namespace = self.namespaces.get(node_id)?;
        let (head, rest) = key_path.split_first()?;
        let mut current = namespace.get(head)?;
        for key in rest {
            current = current.as_object()?.get(key)?;
        }
        Some(current)
    }

    /// All top-level outputs currently stored under `node_id`, or an empty
    /// map if the node hasn't written anything yet.
    pub fn namespace(&self, node_id: &str) -> Map<String, Value> {
        self.namespaces.get(node_id).cloned().unwrap_or_default()
    }

    /// Merge a whole outputs object into `node_id`'s own namespace, one
    /// top-level key at a time. The common write path after a node
    /// finishes: its `NodeRunResult::outputs` land directly under its own
    /// node id rather than one level deeper.
    pub fn merge_outputs(&mut self, node_id: &str, outputs: &Map<String, Value>) {
        let namespace = self.namespaces.entry(node_id.to_string()).or_default();
        for (k, v) in outputs {
            match v {
                Value::Object(nested) => {
                    let slot = namespace
                        .entry(k.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    merge_object(slot, nested.clone());
                }
                other => {
                    namespace.insert(k.clone(), other.clone());
                }
            }
        }
    }
}

fn append_nested(slot: &mut Value, rest: &[String], value: Value) {
    let (head, tail) = rest.split_first().expect("non-empty by construction");
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    let obj = slot.as_object_mut().expect("just coerced to object");

    if tail.is_empty() {
        match value {
            Value::Object(nested) => {
                let entry = obj.entry(head.clone()).or_insert_with(|| Value::Object(Map::new()));
                merge_object(entry, nested);
            }
            other => {
                obj.insert(head.clone(), other);
            }
        }
        return;
    }

    let entry = obj.entry(head.clone()).or_insert_with(|| Value::Object(Map::new()));
    append_nested(entry, tail, value);
}

fn merge_object(slot: &mut Value, incoming: Map<String, Value>) {
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    let obj = slot.as_object_mut().expect("just coerced to object");
    for (k, v) in incoming {
        match v {
            Value::Object(nested) => {
                let entry = obj.entry(k).or_insert_with(|| Value::Object(Map::new()));
                merge_object(entry, nested);
            }
            other => {
                obj.insert(k, other);
            }
        }
    }
}
