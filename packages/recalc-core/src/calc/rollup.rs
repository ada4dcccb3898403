//! Rollup aggregation over looked-up values.

use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;

use super::{display_text, number_value, truthy};

/// Rollup expression that is not `name({values})` with a known name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported rollup expression '{0}'")]
pub struct RollupParseError(pub String);

/// Supported rollup aggregations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupFunction {
    CountAll,
    CountA,
    Count,
    Sum,
    Average,
    Max,
    Min,
    And,
    Or,
    Xor,
    ArrayJoin,
    ArrayUnique,
    ArrayCompact,
    Concatenate,
}

impl FromStr for RollupFunction {
    type Err = RollupParseError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let trimmed = expression.trim();
        let name = trimmed
            .strip_suffix("({values})")
            .ok_or_else(|| RollupParseError(expression.to_string()))?;
        let function = match name.trim().to_ascii_lowercase().as_str() {
            "countall" => RollupFunction::CountAll,
            "counta" => RollupFunction::CountA,
            "count" => RollupFunction::Count,
            "sum" => RollupFunction::Sum,
            "average" => RollupFunction::Average,
            "max" => RollupFunction::Max,
            "min" => RollupFunction::Min,
            "and" => RollupFunction::And,
            "or" => RollupFunction::Or,
            "xor" => RollupFunction::Xor,
            "array_join" => RollupFunction::ArrayJoin,
            "array_unique" => RollupFunction::ArrayUnique,
            "array_compact" => RollupFunction::ArrayCompact,
            "concatenate" => RollupFunction::Concatenate,
            _ => return Err(RollupParseError(expression.to_string())),
        };
        Ok(function)
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

impl RollupFunction {
    /// Whether the aggregate is a list rather than a scalar.
    pub fn returns_list(self) -> bool {
        matches!(self, RollupFunction::ArrayUnique | RollupFunction::ArrayCompact)
    }

    /// Aggregates one value per linked record; list values are flattened.
    pub fn apply(self, values: &[Value]) -> Value {
        let flat: Vec<&Value> = values
            .iter()
            .flat_map(|value| match value {
                Value::Array(items) => items.iter().collect::<Vec<_>>(),
                other => vec![other],
            })
            .collect();
        let numbers: Vec<f64> = flat.iter().filter_map(|v| v.as_f64()).collect();
        let texts = || flat.iter().filter_map(|v| display_text(v)).collect::<Vec<_>>();

        match self {
            RollupFunction::CountAll => Value::from(flat.len()),
            RollupFunction::CountA => Value::from(flat.iter().filter(|v| !is_empty(v)).count()),
            RollupFunction::Count => Value::from(numbers.len()),
            RollupFunction::Sum => number_value(numbers.iter().sum()),
            RollupFunction::Average => {
                if numbers.is_empty() {
                    Value::Null
                } else {
                    number_value(numbers.iter().sum::<f64>() / numbers.len() as f64)
                }
            }
            RollupFunction::Max => numbers
                .iter()
                .copied()
                .reduce(f64::max)
                .map_or(Value::Null, number_value),
            RollupFunction::Min => numbers
                .iter()
                .copied()
                .reduce(f64::min)
                .map_or(Value::Null, number_value),
            RollupFunction::And | RollupFunction::Or | RollupFunction::Xor => {
                let present: Vec<&&Value> = flat.iter().filter(|v| !v.is_null()).collect();
                if present.is_empty() {
                    return Value::Null;
                }
                let truthy_count = present.iter().filter(|v| truthy(v)).count();
                Value::Bool(match self {
                    RollupFunction::And => truthy_count == present.len(),
                    RollupFunction::Or => truthy_count > 0,
                    _ => truthy_count % 2 == 1,
                })
            }
            RollupFunction::ArrayJoin | RollupFunction::Concatenate => {
                let parts = texts();
                if parts.is_empty() {
                    Value::Null
                } else if self == RollupFunction::ArrayJoin {
                    Value::String(parts.join(", "))
                } else {
                    Value::String(parts.concat())
                }
            }
            RollupFunction::ArrayUnique => {
                let mut unique: Vec<Value> = Vec::new();
                for value in flat.iter().filter(|v| !v.is_null()) {
                    if !unique.contains(value) {
                        unique.push((*value).clone());
                    }
                }
                Value::Array(unique)
            }
            RollupFunction::ArrayCompact => Value::Array(
                flat.iter()
                    .filter(|v| !is_empty(v))
                    .map(|v| (*v).clone())
                    .collect(),
            ),
        }
    }
}
