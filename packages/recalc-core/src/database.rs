//! Database container managing schema, dependency edges, and rows.
//!
//! State lives in an immutable [`Snapshot`] behind an `ArcSwap`. Readers and
//! transactions pin a snapshot; commits and schema changes build the next
//! snapshot under a single commit lock and publish it with one pointer swap.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{RecalcError, Result};
use crate::graph::Reference;
use crate::schema;
use crate::table::validation::{physical_name, validate_id, validate_name};
use crate::table::{Field, FieldBuilder, Record, Row, TableData, TableMeta};
use crate::transaction::{Transaction, TransactionHandle};
use crate::types::{self, is_record_id};

/// Author stamped on rows written by storage-level helpers.
pub const SYSTEM_USER: &str = "system";

/// Immutable view of schema, dependency edges, and rows.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Table metadata keyed by table id
    pub tables: BTreeMap<String, TableMeta>,
    /// Field definitions keyed by field id
    pub fields: BTreeMap<String, Field>,
    /// Persisted dependency edges
    pub references: BTreeSet<Reference>,
    /// Rows keyed by physical table name
    pub data: HashMap<String, Arc<TableData>>,
    /// Incremented by every commit and schema change
    pub generation: u64,
}

impl Snapshot {
    pub fn table(&self, table_id: &str) -> Result<&TableMeta> {
        self.tables
            .get(table_id)
            .ok_or_else(|| RecalcError::TableNotFound {
                table: table_id.to_string(),
            })
    }

    pub fn field(&self, field_id: &str) -> Result<&Field> {
        self.fields
            .get(field_id)
            .ok_or_else(|| RecalcError::FieldNotFound {
                field: field_id.to_string(),
            })
    }

    /// Rows of a physical table.
    pub fn data(&self, db_table: &str) -> Result<&TableData> {
        self.data
            .get(db_table)
            .map(Arc::as_ref)
            .ok_or_else(|| RecalcError::TableNotFound {
                table: db_table.to_string(),
            })
    }

    /// Fields of a table in id order.
    pub fn table_fields(&self, table_id: &str) -> Vec<&Field> {
        self.fields
            .values()
            .filter(|field| field.table_id == table_id)
            .collect()
    }

    pub fn primary_field(&self, table_id: &str) -> Option<&Field> {
        self.fields
            .values()
            .find(|field| field.table_id == table_id && field.is_primary)
    }

    /// Table id owning a physical table name.
    pub fn table_id_of(&self, db_table: &str) -> Option<&str> {
        self.tables
            .values()
            .find(|table| table.db_table_name == db_table)
            .map(|table| table.id.as_str())
    }
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReceipt {
    /// Generation of the snapshot published by the commit
    pub generation: u64,
    /// New version of every written record, keyed by table id then record id
    pub versions: BTreeMap<String, BTreeMap<String, u64>>,
}

/// Database container holding the current snapshot.
#[derive(Debug)]
pub struct Database {
    snapshot: ArcSwap<Snapshot>,
    /// Serializes commits and schema changes
    commit_lock: Mutex<()>,
    id_seq: AtomicU64,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    /// Creates a new empty database.
    pub fn new() -> Self {
        Self::from_snapshot(Snapshot::default())
    }

    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            commit_lock: Mutex::new(()),
            id_seq: AtomicU64::new(0),
        }
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Begins a transaction guarded by an auto-aborting handle.
    pub fn begin(&self) -> TransactionHandle {
        TransactionHandle::new(self.begin_transaction())
    }

    /// Begins a bare transaction over the current snapshot.
    pub fn begin_transaction(&self) -> Transaction {
        Transaction::new(self.snapshot())
    }

    /// Commits a transaction.
    ///
    /// # Arguments
    /// * `tx` - Transaction to commit
    /// * `user_id` - Author stamped on every written record
    ///
    /// # Returns
    /// `Result<CommitReceipt>`; fails with `VersionConflict` when a written
    /// record changed since the transaction first wrote it.
    pub fn commit(&self, tx: &mut Transaction, user_id: &str) -> Result<CommitReceipt> {
        self.commit_with(tx, user_id, |_| ())
    }

    /// Commits a transaction and runs `after_swap` while still holding the
    /// commit lock, so hooks observe commits in commit order.
    pub fn commit_with<F>(
        &self,
        tx: &mut Transaction,
        user_id: &str,
        after_swap: F,
    ) -> Result<CommitReceipt>
    where
        F: FnOnce(&CommitReceipt),
    {
        tx.check_active()?;
        let _guard = self.commit_lock.lock();
        let current = self.snapshot.load_full();

        // Sort tables by name so validation and application order is stable
        let mut names: Vec<&String> = tx.staged().keys().collect();
        names.sort();

        for name in &names {
            let buffer = &tx.staged()[*name];
            let data = current.data(name)?;
            let table = current.table_id_of(name).unwrap_or(name.as_str());
            for (record_id, staged) in &buffer.rows {
                match (staged.base_version, data.get(record_id)) {
                    (None, Some(_)) => {
                        return Err(RecalcError::RecordAlreadyExists {
                            table: table.to_string(),
                            record: record_id.clone(),
                        })
                    }
                    (Some(_), None) => {
                        return Err(RecalcError::RecordNotFound {
                            table: table.to_string(),
                            record: record_id.clone(),
                        })
                    }
                    (Some(expected), Some(row)) if row.version != expected => {
                        return Err(RecalcError::VersionConflict {
                            table: table.to_string(),
                            record: record_id.clone(),
                            expected,
                            actual: row.version,
                        })
                    }
                    _ => {}
                }
            }
        }

        let now = Utc::now().timestamp_millis();
        let mut next = (*current).clone();
        let mut receipt = CommitReceipt {
            generation: current.generation + 1,
            versions: BTreeMap::new(),
        };

        for name in names {
            let buffer = &tx.staged()[name];
            if buffer.rows.is_empty() {
                continue;
            }
            let table_id = current.table_id_of(name).unwrap_or(name.as_str()).to_string();
            let versions = receipt.versions.entry(table_id).or_default();
            let data = next
                .data
                .get_mut(name.as_str())
                .ok_or_else(|| RecalcError::TableNotFound {
                    table: name.clone(),
                })?;
            let data = Arc::make_mut(data);
            for (record_id, staged) in &buffer.rows {
                let mut row = data
                    .rows
                    .get(record_id)
                    .map(|row| Row::clone(row))
                    .unwrap_or_else(|| Row::new(record_id));
                for (column, value) in &staged.columns {
                    if value.is_null() {
                        row.columns.remove(column);
                    } else {
                        row.columns.insert(column.clone(), value.clone());
                    }
                }
                row.version += 1;
                row.last_modified_by = Some(user_id.to_string());
                row.last_modified_time = Some(now);
                versions.insert(record_id.clone(), row.version);
                data.rows.insert(record_id.clone(), Arc::new(row));
            }
        }

        next.generation = receipt.generation;
        self.snapshot.store(Arc::new(next));
        tx.mark_committed()?;

        tracing::debug!(
            generation = receipt.generation,
            tables = receipt.versions.len(),
            user = user_id,
            "committed transaction"
        );
        after_swap(&receipt);
        Ok(receipt)
    }

    /// Applies a schema change to a copy of the current snapshot and
    /// publishes it; on error the current snapshot is left untouched.
    pub(crate) fn update_schema<R>(
        &self,
        apply: impl FnOnce(&mut Snapshot) -> Result<R>,
    ) -> Result<R> {
        let _guard = self.commit_lock.lock();
        let mut next = (*self.snapshot.load_full()).clone();
        let result = apply(&mut next)?;
        next.generation += 1;
        self.snapshot.store(Arc::new(next));
        Ok(result)
    }

    /// Generates an identifier with `prefix` not present in `taken`.
    pub(crate) fn generate_id(&self, prefix: &str, taken: impl Fn(&str) -> bool) -> String {
        loop {
            let n = self.id_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let id = format!("{}{:06}", prefix, n);
            if !taken(&id) {
                return id;
            }
        }
    }

    /// Creates a new table with a generated id.
    pub fn create_table(&self, name: &str) -> Result<TableMeta> {
        let snapshot = self.snapshot();
        let id = self.generate_id("tbl", |id| snapshot.tables.contains_key(id));
        self.create_table_with_id(&id, name)
    }

    /// Creates a new table with the given id.
    ///
    /// # Arguments
    /// * `id` - Table identifier (ASCII alphanumerics)
    /// * `name` - Display name
    ///
    /// # Returns
    /// `Result<TableMeta>` describing the created table.
    pub fn create_table_with_id(&self, id: &str, name: &str) -> Result<TableMeta> {
        validate_id(id)?;
        validate_name(id, name)?;
        self.update_schema(|snapshot| {
            if snapshot.tables.contains_key(id) {
                return Err(RecalcError::TableAlreadyExists(id.to_string()));
            }
            let meta = TableMeta {
                id: id.to_string(),
                name: name.to_string(),
                db_table_name: physical_name(name, id),
            };
            snapshot.data.insert(
                meta.db_table_name.clone(),
                Arc::new(TableData::new(&meta.db_table_name)),
            );
            snapshot.tables.insert(id.to_string(), meta.clone());
            tracing::info!(table = id, name, "created table");
            Ok(meta)
        })
    }

    /// Creates a field, its dependency edges, and for links the symmetric
    /// field on the foreign table.
    ///
    /// Existing rows are not recomputed; run
    /// `Recalculator::calculate_fields` afterwards to populate a computed field.
    pub fn create_field(&self, table_id: &str, builder: FieldBuilder) -> Result<Field> {
        self.update_schema(|snapshot| {
            let mut ids = |prefix: &str, snapshot: &Snapshot| {
                self.generate_id(prefix, |id| snapshot.fields.contains_key(id))
            };
            schema::add_field(snapshot, table_id, builder, &mut ids)
        })
    }

    /// Replaces the definition of a non-link field, keeping its id and column.
    pub fn replace_field(&self, field_id: &str, builder: FieldBuilder) -> Result<Field> {
        self.update_schema(|snapshot| schema::redefine_field(snapshot, field_id, builder))
    }

    /// Deletes a field nothing else depends on, with its edges and column.
    /// Deleting a link also deletes its symmetric field and foreign keys.
    pub fn delete_field(&self, field_id: &str) -> Result<()> {
        self.update_schema(|snapshot| schema::remove_field(snapshot, field_id))
    }

    /// Inserts a record with raw field values.
    ///
    /// Computed and link fields are rejected; populate them with the
    /// recalculation engine after insertion.
    pub fn create_record<'a>(
        &self,
        table_id: &str,
        record_id: &str,
        values: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<Record> {
        if !is_record_id(record_id) {
            return Err(RecalcError::InvalidOperation(format!(
                "'{}' is not a record id",
                record_id
            )));
        }
        let mut tx = self.begin_transaction();
        let snapshot = tx.snapshot().clone();
        let table = snapshot.table(table_id)?;
        tx.stage_create(&table.db_table_name, record_id)?;
        for (field_id, value) in values {
            let field = snapshot.field(field_id)?;
            if field.table_id != table_id {
                return Err(RecalcError::FieldNotFound {
                    field: field_id.to_string(),
                });
            }
            if field.is_computed() || field.is_link() {
                return Err(RecalcError::InvalidOperation(format!(
                    "field '{}' is not a raw field",
                    field_id
                )));
            }
            let encoded = types::encode(field, &value)?;
            tx.stage_write(&table.db_table_name, record_id, &field.db_field_name, encoded)?;
        }
        self.commit(&mut tx, SYSTEM_USER)?;
        self.get_record(table_id, record_id)
    }

    /// Reads a record with every field decoded.
    pub fn get_record(&self, table_id: &str, record_id: &str) -> Result<Record> {
        let snapshot = self.snapshot();
        let table = snapshot.table(table_id)?;
        let row = snapshot
            .data(&table.db_table_name)?
            .get(record_id)
            .ok_or_else(|| RecalcError::RecordNotFound {
                table: table_id.to_string(),
                record: record_id.to_string(),
            })?;
        let mut record = Record::new(record_id);
        record.version = row.version;
        for field in snapshot.table_fields(table_id) {
            let value = types::decode(field, &row.column(&field.db_field_name))?;
            record.fields.insert(field.id.clone(), value);
        }
        Ok(record)
    }

    /// Reads the author and time of the last committed write to a record.
    pub fn last_modified(&self, table_id: &str, record_id: &str) -> Result<(Option<String>, Option<i64>)> {
        let snapshot = self.snapshot();
        let table = snapshot.table(table_id)?;
        let row = snapshot
            .data(&table.db_table_name)?
            .get(record_id)
            .ok_or_else(|| RecalcError::RecordNotFound {
                table: table_id.to_string(),
                record: record_id.to_string(),
            })?;
        Ok((row.last_modified_by.clone(), row.last_modified_time))
    }
}
