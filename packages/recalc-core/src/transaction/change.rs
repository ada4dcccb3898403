use serde::{Deserialize, Serialize};

use crate::types::CellValue;

/// A logical change to one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellChange {
    pub table_id: String,
    pub record_id: String,
    pub field_id: String,
    pub old_value: CellValue,
    pub new_value: CellValue,
}

impl CellChange {
    pub fn new(
        table_id: &str,
        record_id: &str,
        field_id: &str,
        old_value: CellValue,
        new_value: CellValue,
    ) -> Self {
        Self {
            table_id: table_id.to_string(),
            record_id: record_id.to_string(),
            field_id: field_id.to_string(),
            old_value,
            new_value,
        }
    }

    /// Identity of the cell this change touches.
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.table_id, &self.record_id, &self.field_id)
    }

    pub fn is_noop(&self) -> bool {
        self.old_value == self.new_value
    }
}
