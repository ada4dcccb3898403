use std::collections::BTreeMap;

use crate::error::{RecalcError, Result};
use crate::types::DbValue;

/// Staged state of one row.
#[derive(Debug, Clone, Default)]
pub struct StagedRow {
    /// Version the row had when first written; `None` for rows created here
    pub base_version: Option<u64>,
    /// Columns written by the transaction
    pub columns: BTreeMap<String, DbValue>,
}

/// Staging buffer for one physical table within a transaction.
///
/// Holds written columns per row; unwritten columns are read through to
/// the snapshot the transaction started from.
#[derive(Debug)]
pub struct StagingBuffer {
    /// Physical table name
    pub db_table_name: String,
    /// Staged rows keyed by record id
    pub rows: BTreeMap<String, StagedRow>,
}

impl StagingBuffer {
    /// Creates a new empty staging buffer for the given table.
    pub fn new(db_table_name: &str) -> Self {
        Self {
            db_table_name: db_table_name.to_string(),
            rows: BTreeMap::new(),
        }
    }

    /// Stages creation of a new row.
    ///
    /// # Arguments
    /// * `record_id` - Identifier of the new row
    ///
    /// # Returns
    /// `Result<()>` failing when the row was already staged.
    pub fn stage_create(&mut self, record_id: &str) -> Result<()> {
        if self.rows.contains_key(record_id) {
            return Err(RecalcError::RecordAlreadyExists {
                table: self.db_table_name.clone(),
                record: record_id.to_string(),
            });
        }
        self.rows
            .insert(record_id.to_string(), StagedRow::default());
        Ok(())
    }

    /// Stages a column write.
    ///
    /// # Arguments
    /// * `record_id` - Row being written
    /// * `base_version` - Snapshot version of the row, recorded on first write
    /// * `column` - Physical column name
    /// * `value` - Value to write
    pub fn stage_update(&mut self, record_id: &str, base_version: u64, column: &str, value: DbValue) {
        let row = self
            .rows
            .entry(record_id.to_string())
            .or_insert_with(|| StagedRow {
                base_version: Some(base_version),
                columns: BTreeMap::new(),
            });
        row.columns.insert(column.to_string(), value);
    }

    /// Returns a staged column value, if written.
    pub fn get(&self, record_id: &str, column: &str) -> Option<&DbValue> {
        self.rows.get(record_id)?.columns.get(column)
    }

    /// Whether the row was created in this transaction.
    pub fn is_created(&self, record_id: &str) -> bool {
        self.rows
            .get(record_id)
            .is_some_and(|row| row.base_version.is_none())
    }

    /// Returns true if no rows are staged.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of staged rows.
    pub fn record_count(&self) -> usize {
        self.rows.len()
    }
}
