//! Structural merging of free-form JSON payloads.

use serde_json::Value;

/// Whether a value is a leaf for merging purposes. Objects and arrays are
/// the only non-scalars.
pub fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_))
}

/// Merge `incoming` into `existing`.
///
/// Objects merge recursively, arrays concatenate, a non-scalar beats a
/// scalar, and on a scalar-vs-scalar conflict the existing side wins.
/// Anything but two objects at the top level returns `existing` unchanged.
pub fn deep_merge(existing: &Value, incoming: &Value) -> Value {
    let (Value::Object(old), Value::Object(new)) = (existing, incoming) else {
        return existing.clone();
    };

    let mut merged = old.clone();
    for (key, new_value) in new {
        let value = match old.get(key) {
            None => new_value.clone(),
            Some(old_value) => match (old_value, new_value) {
                (Value::Object(_), Value::Object(_)) => deep_merge(old_value, new_value),
                (Value::Array(a), Value::Array(b)) => {
                    let mut items = a.clone();
                    items.extend(b.iter().cloned());
                    Value::Array(items)
                }
                _ if is_scalar(old_value) && !is_scalar(new_value) => new_value.clone(),
                _ => old_value.clone(),
            },
        };
        merged.insert(key.clone(), value);
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_classify() {
        assert!(is_scalar(&json!(null)));
        assert!(is_scalar(&json!(true)));
        assert!(is_scalar(&json!(3)));
        assert!(is_scalar(&json!("s")));
        assert!(!is_scalar(&json!([])));
        assert!(!is_scalar(&json!({})));
    }

    #[test]
    fn disjoint_keys_union() {
        let merged = deep_merge(&json!({"a": 1}), &json!({"b": 2}));
        assert_eq!(merged, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn existing_scalar_wins_conflicts() {
        let merged = deep_merge(&json!({"a": 1}), &json!({"a": 2}));
        assert_eq!(merged, json!({"a": 1}));
    }

    #[test]
    fn non_scalar_beats_scalar_in_both_directions() {
        let merged = deep_merge(&json!({"a": true}), &json!({"a": {"deep": 1}}));
        assert_eq!(merged, json!({"a": {"deep": 1}}));

        let merged = deep_merge(&json!({"a": {"deep": 1}}), &json!({"a": true}));
        assert_eq!(merged, json!({"a": {"deep": 1}}));
    }

    #[test]
    fn arrays_concatenate() {
        let merged = deep_merge(&json!({"items": [1, 2]}), &json!({"items": [3]}));
        assert_eq!(merged, json!({"items": [1, 2, 3]}));
    }

    #[test]
    fn objects_merge_recursively() {
        let merged = deep_merge(
            &json!({"completion": {"resolveProvider": true, "triggerCharacters": ["."]}}),
            &json!({"completion": {"triggerCharacters": [":"], "workDoneProgress": false}}),
        );
        assert_eq!(
            merged,
            json!({"completion": {
                "resolveProvider": true,
                "triggerCharacters": [".", ":"],
                "workDoneProgress": false,
            }})
        );
    }
}
