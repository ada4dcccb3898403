use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::CellValue;

/// A record with decoded cell values keyed by field id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub fields: BTreeMap<String, CellValue>,
}

impl Record {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: 0,
            fields: BTreeMap::new(),
        }
    }

    /// Returns the value of `field_id`, null when unset.
    pub fn value(&self, field_id: &str) -> &CellValue {
        static NULL: CellValue = CellValue::Null;
        self.fields.get(field_id).unwrap_or(&NULL)
    }
}
