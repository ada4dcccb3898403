use serde_json::Value;

use super::coerce;
use crate::table::Field;

/// Combines looked-up values of linked records into one cell value.
///
/// Nulls are dropped and nested lists flattened, in link order. An empty
/// result is null for both single- and multi-valued lookups.
pub fn lookup_values(field: &Field, values: Vec<Value>) -> Value {
    let mut flat = Vec::new();
    for value in values {
        match value {
            Value::Null => {}
            Value::Array(items) => flat.extend(items.into_iter().filter(|item| !item.is_null())),
            other => flat.push(other),
        }
    }
    coerce(field, Value::Array(flat))
}
