//! Context Store
//!
//! The run-wide data context is a JSON object keyed by state output keys.
//! It is mutated only by the engine's merge step, on the orchestrating path,
//! after a state has completed. Concurrent branches receive snapshots and
//! return results by value.

use serde_json::{Map, Value};

/// The shared data context of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextStore {
    data: Map<String, Value>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context seeded from an initial value.
    ///
    /// Objects are used as-is, `null` yields an empty context and any other
    /// value is stored under `input`.
    pub fn seeded(initial: Value) -> Self {
        let data = match initial {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };
        Self { data }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Copy of the current context, for filters and branch inputs.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.data.clone())
    }

    /// Merges a state output into the context under `key`.
    pub fn merge(&mut self, key: &str, output: Value) {
        let prior = self.data.remove(key);
        self.data.insert(key.to_string(), merge_value(prior, output));
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Combines a prior value with a new one.
///
/// When both are objects the result is their shallow union, new keys winning.
/// An absent or `null` prior acts as an empty object. In every other case the
/// new value replaces the prior one.
pub fn merge_value(prior: Option<Value>, new: Value) -> Value {
    match (prior, new) {
        (Some(Value::Object(mut prior)), Value::Object(new)) => {
            prior.extend(new);
            Value::Object(prior)
        }
        (_, new) => new,
    }
}

/// Returns `base` with the keys of `top` laid over it. A non-object base
/// contributes nothing.
pub fn overlay(base: &Value, top: &Map<String, Value>) -> Value {
    let mut merged = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for (key, value) in top {
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_into_absent_key() {
        let mut context = ContextStore::new();
        context.merge("AOutput", json!({"x": 1}));
        assert_eq!(context.get("AOutput"), Some(&json!({"x": 1})));
    }

    #[test]
    fn test_merge_objects_new_values_win() {
        let mut context = ContextStore::seeded(json!({"AOutput": {"x": 1, "y": 2}}));
        context.merge("AOutput", json!({"y": 3, "z": 4}));

        assert_eq!(
            context.get("AOutput"),
            Some(&json!({"x": 1, "y": 3, "z": 4}))
        );
    }

    #[test]
    fn test_null_prior_acts_as_empty() {
        let mut context = ContextStore::seeded(json!({"AOutput": null}));
        context.merge("AOutput", json!({"a": true}));
        assert_eq!(context.get("AOutput"), Some(&json!({"a": true})));
    }

    #[test]
    fn test_non_object_values_replace() {
        assert_eq!(merge_value(Some(json!({"a": 1})), json!(5)), json!(5));
        assert_eq!(merge_value(Some(json!([1])), json!({"a": 1})), json!({"a": 1}));
        assert_eq!(merge_value(None, Value::Null), Value::Null);
    }

    #[test]
    fn test_merge_is_shallow() {
        let merged = merge_value(
            Some(json!({"nested": {"a": 1}})),
            json!({"nested": {"b": 2}}),
        );
        assert_eq!(merged, json!({"nested": {"b": 2}}));
    }

    #[test]
    fn test_seeded_variants() {
        assert!(ContextStore::seeded(Value::Null).is_empty());
        assert_eq!(ContextStore::seeded(json!({"a": 1})).len(), 1);
        assert_eq!(
            ContextStore::seeded(json!([1, 2])).into_value(),
            json!({"input": [1, 2]})
        );
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut context = ContextStore::seeded(json!({"a": 1}));
        let snapshot = context.snapshot();
        context.merge("b", json!(2));

        assert_eq!(snapshot, json!({"a": 1}));
        assert_eq!(context.len(), 2);
    }

    #[test]
    fn test_overlay() {
        let mut top = Map::new();
        top.insert("item".to_string(), json!(3));

        assert_eq!(overlay(&json!({"a": 1, "item": 0}), &top), json!({"a": 1, "item": 3}));
        assert_eq!(overlay(&json!("text"), &top), json!({"item": 3}));
    }
}
