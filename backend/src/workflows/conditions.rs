// Workflow Conditions - Branch predicates evaluated against the run context

use kontor_shared::RunContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// A condition node's configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    /// Dotted path into the run context, e.g. `order.total`
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    IsEmpty,
    IsNotEmpty,
    #[serde(other)]
    Unsupported,
}

impl Condition {
    pub fn evaluate(&self, context: &RunContext) -> bool {
        let field_value = context.lookup(&self.field);

        match self.operator {
            ConditionOperator::Equals => field_value
                .map(|v| loosely_equal(v, &self.value))
                .unwrap_or(false),
            ConditionOperator::NotEquals => field_value
                .map(|v| !loosely_equal(v, &self.value))
                .unwrap_or(true),
            ConditionOperator::Contains => field_value
                .map(|v| contains(v, &self.value))
                .unwrap_or(false),
            ConditionOperator::GreaterThan => compare(field_value, &self.value, |a, b| a > b),
            ConditionOperator::LessThan => compare(field_value, &self.value, |a, b| a < b),
            ConditionOperator::IsEmpty => is_empty(field_value),
            ConditionOperator::IsNotEmpty => !is_empty(field_value),
            ConditionOperator::Unsupported => {
                warn!("Unsupported condition operator on field '{}', evaluating to false", self.field);
                false
            }
        }
    }
}

/// Numeric view of a value; numeric strings count.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }

    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return (a - b).abs() < f64::EPSILON;
    }

    match (left, right) {
        (Value::String(s), Value::Bool(b)) | (Value::Bool(b), Value::String(s)) => {
            s.eq_ignore_ascii_case(if *b { "true" } else { "false" })
        }
        _ => false,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => match needle {
            Value::String(n) => s.contains(n.as_str()),
            Value::Number(n) => s.contains(&n.to_string()),
            _ => false,
        },
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Number(n) => match needle {
            Value::String(s) => n.to_string().contains(s.as_str()),
            _ => false,
        },
        _ => false,
    }
}

fn compare(field_value: Option<&Value>, target: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (field_value.and_then(as_number), as_number(target)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

#[cfg(test)]
impl Condition {
    pub fn new(field: &str, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }

    pub fn equals(field: &str, value: Value) -> Self {
        Self::new(field, ConditionOperator::Equals, value)
    }

    pub fn greater_than(field: &str, value: f64) -> Self {
        Self::new(field, ConditionOperator::GreaterThan, serde_json::json!(value))
    }

    pub fn less_than(field: &str, value: f64) -> Self {
        Self::new(field, ConditionOperator::LessThan, serde_json::json!(value))
    }

    pub fn contains(field: &str, needle: &str) -> Self {
        Self::new(field, ConditionOperator::Contains, serde_json::json!(needle))
    }

    pub fn is_empty(field: &str) -> Self {
        Self::new(field, ConditionOperator::IsEmpty, Value::Null)
    }
}
