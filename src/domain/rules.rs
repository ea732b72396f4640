//! Masking rule definitions.
//!
//! Rule sets are defined in YAML, one file per event type:
//!
//! ```yaml
//! synthetic_count: 3
//! masks:
//!   - key: status
//!     type: string
//!     operator: REPLACE
//!     input:
//!       value: REDACTED
//!   - key: machine_id
//!     type: string
//!     operator: RANDOM_INT
//!     input:
//!       lower_limit: 1
//!       upper_limit: 100
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Operator parameters (`input:` block of a rule)
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Value type a rule operates on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RuleType {
    /// String-valued payload fields
    String,

    /// A type this build has no operators for
    Other(String),
}

impl From<String> for RuleType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "string" => Self::String,
            _ => Self::Other(s),
        }
    }
}

impl From<RuleType> for String {
    fn from(t: RuleType) -> Self {
        t.to_string()
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Transformation applied to a field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    /// Overwrite the field with `input.value`
    Replace,

    /// Uniform integer in `[input.lower_limit, input.upper_limit)`
    RandomInt,

    /// An operator this build does not know
    Other(String),
}

impl From<String> for Operator {
    fn from(s: String) -> Self {
        match s.as_str() {
            "REPLACE" => Self::Replace,
            "RANDOM_INT" => Self::RandomInt,
            _ => Self::Other(s),
        }
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.to_string()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replace => write!(f, "REPLACE"),
            Self::RandomInt => write!(f, "RANDOM_INT"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

/// A single field transformation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskOperation {
    /// Payload field to transform
    pub key: String,

    /// Operator to apply
    pub operator: Operator,

    /// Operator-specific parameters
    #[serde(default)]
    pub input: Params,

    /// Value type of the field
    #[serde(rename = "type")]
    pub rule_type: RuleType,
}

impl MaskOperation {
    /// Create a string-typed operation
    pub fn string(key: impl Into<String>, operator: Operator, input: Params) -> Self {
        Self {
            key: key.into(),
            operator,
            input,
            rule_type: RuleType::String,
        }
    }
}

/// Ordered transformations plus replica count for one event type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    /// Number of synthetic replicas generated per raw event
    #[serde(default, rename = "synthetic_count")]
    pub synth_amount: usize,

    /// Operations applied in declared order
    #[serde(default, rename = "masks")]
    pub operations: Vec<MaskOperation>,
}

impl RuleSet {
    /// Parse a rule set from YAML content
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}

/// All rule sets, keyed by `<event_type>_mask`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleBook {
    sets: HashMap<String, RuleSet>,
}

impl RuleBook {
    /// Create an empty rule book
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a rule set, replacing any previous one under the same key
    pub fn insert(&mut self, key: impl Into<String>, set: RuleSet) -> Option<RuleSet> {
        self.sets.insert(key.into(), set)
    }

    /// Get a rule set by key
    pub fn get(&self, key: &str) -> Option<&RuleSet> {
        self.sets.get(key)
    }

    /// Rule set for an event type; an empty set when none is defined
    pub fn for_event_type(&self, event_type: &str) -> RuleSet {
        self.sets
            .get(&format!("{}_mask", event_type))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of rule sets
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Rule sets sorted by key
    pub fn sorted(&self) -> Vec<(&String, &RuleSet)> {
        let mut entries: Vec<_> = self.sets.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

impl FromIterator<(String, RuleSet)> for RuleBook {
    fn from_iter<I: IntoIterator<Item = (String, RuleSet)>>(iter: I) -> Self {
        Self {
            sets: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENSOR_RULES: &str = r#"
synthetic_count: 2
masks:
  - key: status
    type: string
    operator: REPLACE
    input:
      value: REDACTED
  - key: machine_id
    type: string
    operator: RANDOM_INT
    input:
      lower_limit: 1
      upper_limit: "100"
"#;

    #[test]
    fn test_rule_set_parsing() {
        let set = RuleSet::from_yaml(SENSOR_RULES).unwrap();

        assert_eq!(set.synth_amount, 2);
        assert_eq!(set.operations.len(), 2);
        assert_eq!(set.operations[0].operator, Operator::Replace);
        assert_eq!(set.operations[0].rule_type, RuleType::String);
        assert_eq!(set.operations[1].operator, Operator::RandomInt);
        assert_eq!(set.operations[1].input["lower_limit"], serde_json::json!(1));
    }

    #[test]
    fn test_unknown_operator_is_preserved() {
        let yaml = r#"
masks:
  - key: name
    type: bytes
    operator: HASH
"#;
        let set = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(set.synth_amount, 0);
        assert_eq!(set.operations[0].operator, Operator::Other("HASH".to_string()));
        assert_eq!(set.operations[0].rule_type, RuleType::Other("bytes".to_string()));
        assert!(set.operations[0].input.is_empty());
    }

    #[test]
    fn test_missing_rule_set_is_empty() {
        let mut book = RuleBook::new();
        book.insert("sensor_mask", RuleSet::from_yaml(SENSOR_RULES).unwrap());

        assert_eq!(book.for_event_type("sensor").operations.len(), 2);
        assert_eq!(book.for_event_type("other"), RuleSet::default());
    }
}
