//! Payload flattening for embedding.
//!
//! Nested maps become dotted keys (`parent.child`), array elements become
//! indexed keys (`parent.0`, `parent.1`, ...), scalars are copied through.

use serde_json::Value;

use crate::domain::Payload;

/// Flatten a payload into dotted keys
pub fn flatten(payload: &Payload) -> Payload {
    let mut result = Payload::new();
    flatten_into(&mut result, "", payload);
    result
}

/// Flatten `map` into `result`, prefixing every key with `prefix`
pub fn flatten_into(result: &mut Payload, prefix: &str, map: &Payload) {
    for (key, value) in map {
        let key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        flatten_value(result, key, value);
    }
}

fn flatten_value(result: &mut Payload, key: String, value: &Value) {
    match value {
        Value::Object(map) => flatten_into(result, &key, map),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten_value(result, format!("{}.{}", key, i), item);
            }
        }
        scalar => {
            result.insert(key, scalar.clone());
        }
    }
}

/// Plain-text rendering of a flattened payload, as handed to the embedder
pub fn embedding_text(payload: &Payload) -> String {
    Value::Object(flatten(payload)).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_nested_maps_and_arrays() {
        let input = payload(json!({
            "machine": { "id": "4", "location": { "field": "field_1" } },
            "readings": [1, { "temp": 20 }, [true, false]],
            "status": "running"
        }));

        let flat = flatten(&input);
        assert_eq!(
            Value::Object(flat),
            json!({
                "machine.id": "4",
                "machine.location.field": "field_1",
                "readings.0": 1,
                "readings.1.temp": 20,
                "readings.2.0": true,
                "readings.2.1": false,
                "status": "running"
            })
        );
    }

    #[test]
    fn test_flat_payload_is_unchanged() {
        let input = payload(json!({ "id": "4", "status": "running", "count": 3 }));
        assert_eq!(flatten(&input), input);

        let mut prefixed = Payload::new();
        flatten_into(&mut prefixed, "event", &input);
        assert_eq!(
            Value::Object(prefixed),
            json!({ "event.id": "4", "event.status": "running", "event.count": 3 })
        );
    }

    #[test]
    fn test_embedding_text() {
        let input = payload(json!({ "a": { "b": "c" } }));
        assert_eq!(embedding_text(&input), r#"{"a.b":"c"}"#);
    }
}
