//! Field operators used by masking rules.
//!
//! Operators are pure functions `(current, params) -> new value`, registered
//! under a `(RuleType, Operator)` pair. Each operator also carries a
//! validator so malformed parameters can be rejected when rule files load.

use std::collections::HashMap;

use rand::Rng;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{MaskOperation, Operator, Params, RuleType};

/// Malformed operator parameters
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperatorInputError {
    #[error("Missing parameter '{param}'")]
    MissingParam { param: String },

    #[error("Parameter '{param}' is not a valid integer: {value}")]
    InvalidInteger { param: String, value: String },

    #[error("Parameter '{param}' must be a scalar value")]
    NotScalar { param: String },

    #[error("Inverted range: lower_limit {lower} > upper_limit {upper}")]
    InvertedRange { lower: i64, upper: i64 },
}

/// Apply function: current field value and parameters to new value
pub type ApplyFn = fn(&str, &Params) -> Result<String, OperatorInputError>;

/// Parameter validation run at rule-load time
pub type ValidateFn = fn(&Params) -> Result<(), OperatorInputError>;

/// A registered operator
#[derive(Debug, Clone, Copy)]
pub struct OperatorSpec {
    pub apply: ApplyFn,
    pub validate: ValidateFn,
}

/// Operators keyed by `(RuleType, Operator)`
#[derive(Debug, Clone)]
pub struct OperatorRegistry {
    ops: HashMap<(RuleType, Operator), OperatorSpec>,
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl OperatorRegistry {
    /// Registry with no operators
    pub fn empty() -> Self {
        Self {
            ops: HashMap::new(),
        }
    }

    /// Registry with the built-in string operators
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(
            RuleType::String,
            Operator::Replace,
            OperatorSpec {
                apply: replace,
                validate: validate_replace,
            },
        );
        registry.register(
            RuleType::String,
            Operator::RandomInt,
            OperatorSpec {
                apply: random_int,
                validate: validate_random_int,
            },
        );
        registry
    }

    /// Register (or replace) an operator
    pub fn register(&mut self, rule_type: RuleType, operator: Operator, spec: OperatorSpec) {
        self.ops.insert((rule_type, operator), spec);
    }

    /// Look up the operator for a rule
    pub fn get(&self, rule_type: &RuleType, operator: &Operator) -> Option<&OperatorSpec> {
        self.ops.get(&(rule_type.clone(), operator.clone()))
    }

    /// Whether the rule's `(type, operator)` pair is registered
    pub fn supports(&self, op: &MaskOperation) -> bool {
        self.get(&op.rule_type, &op.operator).is_some()
    }

    /// Validate a rule's parameters. Unregistered operators validate trivially.
    pub fn validate(&self, op: &MaskOperation) -> Result<(), OperatorInputError> {
        match self.get(&op.rule_type, &op.operator) {
            Some(spec) => (spec.validate)(&op.input),
            None => Ok(()),
        }
    }
}

/// REPLACE: the field becomes `params.value`, whatever it held before
pub fn replace(_current: &str, params: &Params) -> Result<String, OperatorInputError> {
    scalar_param(params, "value")
}

fn validate_replace(params: &Params) -> Result<(), OperatorInputError> {
    scalar_param(params, "value").map(|_| ())
}

/// RANDOM_INT: uniform integer in `[lower_limit, upper_limit)`
///
/// Equal limits yield `lower_limit`.
pub fn random_int(_current: &str, params: &Params) -> Result<String, OperatorInputError> {
    let (lower, upper) = limits(params)?;
    if lower == upper {
        return Ok(lower.to_string());
    }

    let value = rand::thread_rng().gen_range(lower..upper);
    Ok(value.to_string())
}

fn validate_random_int(params: &Params) -> Result<(), OperatorInputError> {
    limits(params).map(|_| ())
}

fn limits(params: &Params) -> Result<(i64, i64), OperatorInputError> {
    let upper = integer_param(params, "upper_limit")?;
    let lower = integer_param(params, "lower_limit")?;

    if lower > upper {
        return Err(OperatorInputError::InvertedRange { lower, upper });
    }
    Ok((lower, upper))
}

/// Read a parameter as text; numbers and booleans are rendered as written
fn scalar_param(params: &Params, name: &str) -> Result<String, OperatorInputError> {
    match params.get(name) {
        None | Some(Value::Null) => Err(OperatorInputError::MissingParam {
            param: name.to_string(),
        }),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(_) => Err(OperatorInputError::NotScalar {
            param: name.to_string(),
        }),
    }
}

fn integer_param(params: &Params, name: &str) -> Result<i64, OperatorInputError> {
    let raw = scalar_param(params, name)?;
    raw.trim()
        .parse::<i64>()
        .map_err(|_| OperatorInputError::InvalidInteger {
            param: name.to_string(),
            value: raw,
        })
}
