//! Cell value types and their physical representation.

mod codec;

pub use codec::{canonicalize, decode, encode, is_record_id};

use serde::{Deserialize, Serialize};

/// Logical cell value as seen by clients and the calculator.
pub type CellValue = serde_json::Value;

/// Declared scalar type of a field's cell values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CellValueType {
    String,
    Number,
    Boolean,
    DateTime,
}

/// Physical column value as held in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DbValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    /// JSON text for link and multi-valued cells
    Json(String),
}

impl DbValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }
}

impl Default for DbValue {
    fn default() -> Self {
        DbValue::Null
    }
}
