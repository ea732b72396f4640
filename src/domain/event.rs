//! Event types flowing through the distribution fabric.
//!
//! An [`Event`] is a typed payload bag. Its `event_type` is the routing and
//! rule-lookup key; its payload keeps insertion order so masked and
//! synthesized copies serialize with the same field layout as the input.

use serde::{Deserialize, Serialize};

/// Ordered key/value payload of an event
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Type prefix applied to masked copies
pub const MASKED_PREFIX: &str = "masked_";

/// Type prefix applied to synthetic replicas
pub const SYNTHED_PREFIX: &str = "synthed_";

/// Event type that bypasses fan-out and goes to the chat queue only
pub const CHAT_EVENT_TYPE: &str = "chat";

/// The atomic unit of data moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Routing and rule-lookup key (never empty once delivered)
    #[serde(rename = "type", alias = "Type")]
    pub event_type: String,

    /// Event body; may nest maps and arrays
    #[serde(default, alias = "Payload")]
    pub payload: Payload,
}

impl Event {
    /// Create a new event
    pub fn new(event_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Parse an event from a JSON object
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Whether this event must be routed to the chat queue only
    pub fn is_chat(&self) -> bool {
        self.event_type == CHAT_EVENT_TYPE
    }

    /// Key under which this event's rule set is stored
    pub fn rule_key(&self) -> String {
        format!("{}_mask", self.event_type)
    }

    /// Copy of this event renamed with the given type prefix
    pub fn derive(&self, prefix: &str) -> Self {
        Self {
            event_type: format!("{}{}", prefix, self.event_type),
            payload: self.payload.clone(),
        }
    }

    /// Get a string-valued payload field
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// A raw event paired with the masked (or synthesized) copy derived from it.
#[derive(Debug, Clone)]
pub struct MaskedEvent {
    /// The event as it arrived
    pub raw_event: Event,

    /// The transformed copy (`masked_<type>` or `synthed_<type>`)
    pub masked_event: Event,

    /// Type of the raw event
    pub event_type: String,
}

impl MaskedEvent {
    /// Start a derivation: the masked copy is the raw event renamed with `prefix`
    pub fn from_raw(raw_event: &Event, prefix: &str) -> Self {
        Self {
            raw_event: raw_event.clone(),
            masked_event: raw_event.derive(prefix),
            event_type: raw_event.event_type.clone(),
        }
    }

    /// Consume and return only the transformed event
    pub fn into_masked(self) -> Event {
        self.masked_event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sensor() -> Event {
        let payload = json!({ "id": "4", "status": "running" });
        Event::new("sensor", payload.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_rule_key() {
        assert_eq!(sensor().rule_key(), "sensor_mask");
    }

    #[test]
    fn test_derive_keeps_payload_order() {
        let derived = sensor().derive(MASKED_PREFIX);
        assert_eq!(derived.event_type, "masked_sensor");

        let keys: Vec<&String> = derived.payload.keys().collect();
        assert_eq!(keys, vec!["id", "status"]);
    }

    #[test]
    fn test_parse_accepts_capitalized_fields() {
        let event = Event::from_json(r#"{"Type":"chat","Payload":{"question":"hi"}}"#).unwrap();
        assert!(event.is_chat());
        assert_eq!(event.str_field("question"), Some("hi"));

        let event = Event::from_json(r#"{"type":"sensor"}"#).unwrap();
        assert!(event.payload.is_empty());
    }
}
