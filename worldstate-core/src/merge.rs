//! Deep merge of JSON objects.
//!
//! Objects merge key by key, recursively. Every other value (scalars, `null`,
//! arrays) replaces whatever was there.

use serde_json::{Map, Value};

/// Merges `patch` into `target` in place.
pub fn deep_merge(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, incoming) in patch {
        match (target.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(nested)) => deep_merge(existing, nested),
            _ => {
                target.insert(key.clone(), incoming.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_scalars_overwrite() {
        let mut target = obj(json!({ "hp": 10, "name": "a" }));
        deep_merge(&mut target, &obj(json!({ "hp": 5 })));
        assert_eq!(Value::Object(target), json!({ "hp": 5, "name": "a" }));
    }

    #[test]
    fn test_nested_objects_merge() {
        let mut target = obj(json!({ "pos": { "x": 1, "y": 2 }, "cargo": { "ore": 3 } }));
        deep_merge(&mut target, &obj(json!({ "pos": { "y": 9, "z": 0 } })));
        assert_eq!(
            Value::Object(target),
            json!({ "pos": { "x": 1, "y": 9, "z": 0 }, "cargo": { "ore": 3 } })
        );
    }

    #[test]
    fn test_arrays_replace_wholesale() {
        let mut target = obj(json!({ "modules": [1, 2, 3] }));
        deep_merge(&mut target, &obj(json!({ "modules": [4] })));
        assert_eq!(Value::Object(target), json!({ "modules": [4] }));
    }

    #[test]
    fn test_object_replaces_scalar_and_null_overwrites() {
        let mut target = obj(json!({ "a": 1, "b": { "c": 2 } }));
        deep_merge(&mut target, &obj(json!({ "a": { "x": 1 }, "b": null })));
        assert_eq!(Value::Object(target), json!({ "a": { "x": 1 }, "b": null }));
    }
}
