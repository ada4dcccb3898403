//! Table metadata and physical row storage.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::relation::ID_COLUMN;
use crate::types::DbValue;

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMeta {
    /// Table identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Physical table name
    pub db_table_name: String,
}

/// One physical row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub id: String,
    /// Incremented by one on every committed write
    pub version: u64,
    pub columns: BTreeMap<String, DbValue>,
    pub last_modified_by: Option<String>,
    /// Epoch milliseconds of the last committed write
    pub last_modified_time: Option<i64>,
}

impl Row {
    /// Creates an empty row at version 0.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: 0,
            columns: BTreeMap::new(),
            last_modified_by: None,
            last_modified_time: None,
        }
    }

    /// Reads a column, treating `__id` as the row id and absent columns as null.
    pub fn column(&self, name: &str) -> DbValue {
        if name == ID_COLUMN {
            return DbValue::Text(self.id.clone());
        }
        self.columns.get(name).cloned().unwrap_or(DbValue::Null)
    }
}

/// Rows of one physical table, keyed by record id.
///
/// Rows are shared between snapshots; a commit replaces only the rows it wrote.
#[derive(Debug, Clone, Default)]
pub struct TableData {
    pub db_table_name: String,
    pub rows: BTreeMap<String, Arc<Row>>,
}

impl TableData {
    pub fn new(db_table_name: &str) -> Self {
        Self {
            db_table_name: db_table_name.to_string(),
            rows: BTreeMap::new(),
        }
    }

    pub fn record_count(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, record_id: &str) -> Option<&Arc<Row>> {
        self.rows.get(record_id)
    }
}
