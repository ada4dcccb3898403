use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::database::Snapshot;
use crate::error::{RecalcError, Result};
use crate::table::{TableData, ID_COLUMN};
use crate::types::DbValue;

use super::staging_buffer::StagingBuffer;

/// Transaction context holding staged changes across multiple tables.
///
/// Reads see the snapshot pinned at begin with the transaction's own
/// writes layered on top. Changes stay invisible to other readers until
/// commit.
#[derive(Debug)]
pub struct Transaction {
    /// Snapshot pinned when the transaction began
    snapshot: Arc<Snapshot>,
    /// Map of physical table name to staging buffer
    staging: HashMap<String, StagingBuffer>,
    /// Whether the transaction has been committed
    committed: AtomicBool,
    /// Whether the transaction has been aborted
    aborted: AtomicBool,
}

impl Transaction {
    /// Creates a new empty transaction over `snapshot`.
    pub(crate) fn new(snapshot: Arc<Snapshot>) -> Self {
        Self {
            snapshot,
            staging: HashMap::new(),
            committed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        }
    }

    /// Snapshot this transaction reads from.
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_committed() {
            return Err(RecalcError::TransactionConflict(
                "transaction already committed".to_string(),
            ));
        }
        if self.is_aborted() {
            return Err(RecalcError::TransactionConflict(
                "transaction aborted".to_string(),
            ));
        }
        Ok(())
    }

    fn table_data(&self, db_table: &str) -> Result<&TableData> {
        self.snapshot.data(db_table)
    }

    fn record_not_found(db_table: &str, record_id: &str) -> RecalcError {
        RecalcError::RecordNotFound {
            table: db_table.to_string(),
            record: record_id.to_string(),
        }
    }

    /// Returns whether the record is visible to this transaction.
    pub fn record_exists(&self, db_table: &str, record_id: &str) -> bool {
        let staged = self
            .staging
            .get(db_table)
            .is_some_and(|buffer| buffer.is_created(record_id));
        staged
            || self
                .table_data(db_table)
                .is_ok_and(|data| data.get(record_id).is_some())
    }

    /// Returns the committed version of a record; 0 for records created here.
    pub fn record_version(&self, db_table: &str, record_id: &str) -> Result<u64> {
        if let Some(row) = self.table_data(db_table)?.get(record_id) {
            return Ok(row.version);
        }
        if self
            .staging
            .get(db_table)
            .is_some_and(|buffer| buffer.is_created(record_id))
        {
            return Ok(0);
        }
        Err(Self::record_not_found(db_table, record_id))
    }

    /// Reads a column through the staging overlay.
    ///
    /// # Arguments
    /// * `db_table` - Physical table name
    /// * `record_id` - Record identifier
    /// * `column` - Physical column name (`__id` reads the id)
    ///
    /// # Returns
    /// `Result<DbValue>`; absent columns read as null.
    pub fn read_column(&self, db_table: &str, record_id: &str, column: &str) -> Result<DbValue> {
        if let Some(buffer) = self.staging.get(db_table) {
            if let Some(value) = buffer.get(record_id, column) {
                return Ok(value.clone());
            }
            if buffer.is_created(record_id) {
                return Ok(if column == ID_COLUMN {
                    DbValue::Text(record_id.to_string())
                } else {
                    DbValue::Null
                });
            }
        }
        self.table_data(db_table)?
            .get(record_id)
            .map(|row| row.column(column))
            .ok_or_else(|| Self::record_not_found(db_table, record_id))
    }

    /// Lists visible record ids in ascending order.
    pub fn record_ids(&self, db_table: &str) -> Result<Vec<String>> {
        let mut ids: BTreeSet<&str> = self
            .table_data(db_table)?
            .rows
            .keys()
            .map(String::as_str)
            .collect();
        if let Some(buffer) = self.staging.get(db_table) {
            ids.extend(
                buffer
                    .rows
                    .iter()
                    .filter(|(_, row)| row.base_version.is_none())
                    .map(|(id, _)| id.as_str()),
            );
        }
        Ok(ids.into_iter().map(str::to_string).collect())
    }

    /// Finds rows whose `column` holds one of `keys` as text.
    ///
    /// # Returns
    /// `(record_id, key)` pairs in record id order.
    pub fn find_by_column(
        &self,
        db_table: &str,
        column: &str,
        keys: &BTreeSet<String>,
    ) -> Result<Vec<(String, String)>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for record_id in self.record_ids(db_table)? {
            if let DbValue::Text(key) = self.read_column(db_table, &record_id, column)? {
                if keys.contains(&key) {
                    found.push((record_id, key));
                }
            }
        }
        Ok(found)
    }

    fn staging_buffer(&mut self, db_table: &str) -> Result<&mut StagingBuffer> {
        self.ensure_active()?;
        self.table_data(db_table)?;
        Ok(self
            .staging
            .entry(db_table.to_string())
            .or_insert_with(|| StagingBuffer::new(db_table)))
    }

    /// Stages creation of an empty record.
    pub fn stage_create(&mut self, db_table: &str, record_id: &str) -> Result<()> {
        if self.record_exists(db_table, record_id) {
            return Err(RecalcError::RecordAlreadyExists {
                table: db_table.to_string(),
                record: record_id.to_string(),
            });
        }
        self.staging_buffer(db_table)?.stage_create(record_id)
    }

    /// Stages a column write on an existing or staged record.
    pub fn stage_write(
        &mut self,
        db_table: &str,
        record_id: &str,
        column: &str,
        value: DbValue,
    ) -> Result<()> {
        let base_version = self.record_version(db_table, record_id)?;
        self.staging_buffer(db_table)?
            .stage_update(record_id, base_version, column, value);
        Ok(())
    }

    /// Staging buffers keyed by physical table name.
    pub fn staged(&self) -> &HashMap<String, StagingBuffer> {
        &self.staging
    }

    /// Returns whether any table has staged changes.
    pub fn has_staged_changes(&self) -> bool {
        self.staging.values().any(|buffer| !buffer.is_empty())
    }

    /// Number of tables with staging buffers.
    pub fn staged_table_count(&self) -> usize {
        self.staging.len()
    }

    pub(crate) fn mark_committed(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.committed.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn check_active(&self) -> Result<()> {
        self.ensure_active()
    }

    /// Aborts the transaction, discarding all staged changes.
    pub fn abort(&mut self) {
        if !self.is_committed() && !self.is_aborted() {
            self.aborted.store(true, Ordering::Release);
            self.staging.clear();
        }
    }

    /// Returns whether the transaction has been committed.
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    /// Returns whether the transaction has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Returns whether the transaction is still active.
    pub fn is_active(&self) -> bool {
        !self.is_committed() && !self.is_aborted()
    }
}
