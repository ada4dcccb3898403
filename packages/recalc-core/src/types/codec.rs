use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};

use super::{CellValueType, DbValue};
use crate::error::{RecalcError, Result};
use crate::table::Field;

/// Returns true when `s` has the shape of a record id: `rec` followed by
/// one or more ASCII alphanumerics.
pub fn is_record_id(s: &str) -> bool {
    s.len() > 3 && s.starts_with("rec") && s[3..].chars().all(|c| c.is_ascii_alphanumeric())
}

fn codec_error(field: &Field, message: impl Into<String>) -> RecalcError {
    RecalcError::Codec {
        field: field.id.clone(),
        message: message.into(),
    }
}

/// Converts a logical cell value into its physical column value.
///
/// Link and multi-valued cells are stored as JSON text. Booleans and
/// date-times are stored as integers (0/1 and epoch milliseconds).
pub fn encode(field: &Field, value: &Value) -> Result<DbValue> {
    if value.is_null() {
        return Ok(DbValue::Null);
    }

    if field.is_link() || field.is_multiple_cell_value {
        if field.is_multiple_cell_value && !value.is_array() {
            return Err(codec_error(field, "expected a list value"));
        }
        return Ok(DbValue::Json(serde_json::to_string(value)?));
    }

    match field.cell_value_type {
        CellValueType::String => match value {
            Value::String(s) => Ok(DbValue::Text(s.clone())),
            other => Err(codec_error(field, format!("expected text, got {}", other))),
        },
        CellValueType::Number => match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(DbValue::Integer(i)),
                None => n
                    .as_f64()
                    .map(DbValue::Real)
                    .ok_or_else(|| codec_error(field, "number out of range")),
            },
            other => Err(codec_error(field, format!("expected number, got {}", other))),
        },
        CellValueType::Boolean => match value {
            Value::Bool(b) => Ok(DbValue::Integer(i64::from(*b))),
            other => Err(codec_error(field, format!("expected boolean, got {}", other))),
        },
        CellValueType::DateTime => match value {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| DbValue::Integer(dt.with_timezone(&Utc).timestamp_millis()))
                .map_err(|e| codec_error(field, format!("invalid date-time '{}': {}", s, e))),
            other => Err(codec_error(field, format!("expected date-time, got {}", other))),
        },
    }
}

/// Encodes `value` and decodes it again, returning the stored form and the
/// value every later read of the cell returns.
pub fn canonicalize(field: &Field, value: &Value) -> Result<(DbValue, Value)> {
    let stored = encode(field, value)?;
    let canonical = decode(field, &stored)?;
    Ok((stored, canonical))
}

/// Converts a physical column value back into a logical cell value.
pub fn decode(field: &Field, value: &DbValue) -> Result<Value> {
    match value {
        DbValue::Null => Ok(Value::Null),
        DbValue::Json(text) => serde_json::from_str(text)
            .map_err(|e| codec_error(field, format!("invalid stored JSON: {}", e))),
        DbValue::Text(s) => Ok(Value::String(s.clone())),
        DbValue::Real(f) => Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| codec_error(field, "non-finite number in storage")),
        DbValue::Integer(i) => match field.cell_value_type {
            CellValueType::Boolean => Ok(Value::Bool(*i != 0)),
            CellValueType::DateTime => DateTime::<Utc>::from_timestamp_millis(*i)
                .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)))
                .ok_or_else(|| codec_error(field, "timestamp out of range")),
            CellValueType::String => Ok(Value::String(i.to_string())),
            CellValueType::Number => Ok(Value::from(*i)),
        },
    }
}
