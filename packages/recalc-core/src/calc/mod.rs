//! Per-field value computation.
//!
//! The calculator is pure: it receives the record being computed and, for
//! lookups, rollups and link titles, the values gathered from linked
//! records in link order. Resolving which records are linked is the
//! cascade's job.

mod formula;
mod lookup;
mod rollup;

pub use formula::{preprocess, FormulaEvaluator};
pub use lookup::lookup_values;
pub use rollup::{RollupFunction, RollupParseError};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};

use crate::error::{RecalcError, Result};
use crate::link::{link_cell, LinkItem};
use crate::table::{Field, FieldKind, Record};
use crate::types::CellValueType;

/// Value of the looked-up (or title) field on one linked record.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedValue {
    pub record_id: String,
    pub value: Value,
}

impl LinkedValue {
    pub fn new(record_id: &str, value: Value) -> Self {
        Self {
            record_id: record_id.to_string(),
            value,
        }
    }
}

/// Computes formula, lookup, rollup and link-title values.
#[derive(Debug, Default)]
pub struct Calculator {
    formulas: FormulaEvaluator,
}

impl Calculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the value of `field` for `record`.
    ///
    /// # Arguments
    /// * `field` - Field to compute
    /// * `record` - Record with the same-table values the field reads
    /// * `linked` - Looked-up values of linked records, in link order
    ///
    /// # Returns
    /// `Result<Value>` coerced to the field's type and multiplicity.
    pub fn compute(&self, field: &Field, record: &Record, linked: &[LinkedValue]) -> Result<Value> {
        match &field.kind {
            FieldKind::Raw => Ok(record.value(&field.id).clone()),
            FieldKind::Formula { expression } => {
                let value = self.formulas.evaluate(field, expression, &record.fields)?;
                Ok(coerce(field, value))
            }
            FieldKind::Lookup { .. } => Ok(lookup_values(
                field,
                linked.iter().map(|l| l.value.clone()).collect(),
            )),
            FieldKind::Rollup { expression, .. } => {
                let function: RollupFunction =
                    expression.parse().map_err(|e: RollupParseError| RecalcError::Formula {
                        field: field.id.clone(),
                        message: e.to_string(),
                    })?;
                let values: Vec<Value> = linked.iter().map(|l| l.value.clone()).collect();
                Ok(coerce(field, function.apply(&values)))
            }
            FieldKind::Link(_) => Ok(link_cell(
                field,
                linked
                    .iter()
                    .map(|l| LinkItem::new(&l.record_id, display_text(&l.value)))
                    .collect(),
            )),
        }
    }
}

/// Number value; integral results within the exact range become integers.
pub(crate) fn number_value(f: f64) -> Value {
    const EXACT: f64 = 9_007_199_254_740_992.0;
    if f.fract() == 0.0 && f.abs() < EXACT {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map_or(Value::Null, Value::Number)
    }
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => items.iter().any(truthy),
        Value::Object(_) => true,
    }
}

/// Display text of a value; link items show their title.
pub fn display_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(display_text).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        Value::Object(map) => match map.get("title") {
            Some(title) => display_text(title),
            None => Some(value.to_string()),
        },
    }
}

fn coerce_scalar(cell_value_type: CellValueType, value: Value) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    match cell_value_type {
        CellValueType::Number => match value {
            Value::Number(n) if n.is_f64() => n.as_f64().map_or(Value::Null, number_value),
            Value::Number(_) => value,
            Value::String(s) => s.trim().parse::<f64>().map_or(Value::Null, number_value),
            Value::Bool(b) => Value::from(i64::from(b)),
            _ => Value::Null,
        },
        CellValueType::String => display_text(&value).map_or(Value::Null, Value::String),
        CellValueType::Boolean => Value::Bool(truthy(&value)),
        CellValueType::DateTime => match &value {
            Value::String(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(dt) => Value::String(
                    dt.with_timezone(&Utc)
                        .to_rfc3339_opts(SecondsFormat::Millis, true),
                ),
                Err(_) => Value::Null,
            },
            Value::Number(n) => n
                .as_i64()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .map_or(Value::Null, |dt| {
                    Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
                }),
            _ => Value::Null,
        },
    }
}

/// Coerces a computed value to the field's declared type and multiplicity.
///
/// Multi-valued results are lists with nulls removed; single-valued fields
/// receive one value (text fields join list items). Empty results are null.
pub fn coerce(field: &Field, value: Value) -> Value {
    if field.is_multiple_cell_value {
        let items = match value {
            Value::Null => Vec::new(),
            Value::Array(items) => items,
            other => vec![other],
        };
        let coerced: Vec<Value> = items
            .into_iter()
            .map(|item| coerce_scalar(field.cell_value_type, item))
            .filter(|item| !item.is_null())
            .collect();
        if coerced.is_empty() {
            Value::Null
        } else {
            Value::Array(coerced)
        }
    } else {
        match value {
            Value::Array(items) if field.cell_value_type == CellValueType::String => {
                coerce_scalar(field.cell_value_type, Value::Array(items))
            }
            Value::Array(items) => items
                .into_iter()
                .map(|item| coerce_scalar(field.cell_value_type, item))
                .find(|item| !item.is_null())
                .unwrap_or(Value::Null),
            other => coerce_scalar(field.cell_value_type, other),
        }
    }
}
