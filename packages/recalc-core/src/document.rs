//! JSON workspace documents: tables, fields and records in one file.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::database::{Database, Snapshot};
use crate::error::{RecalcError, Result};
use crate::graph::{reaches, references_for, Reference};
use crate::link::link_ids;
use crate::table::{Field, Record, Row, TableData, TableMeta};
use crate::types::{self, DbValue};

/// Serializable image of a database.
///
/// Link cells are authoritative on import: foreign keys are rebuilt from
/// the many-to-one side of every link pair. Dependency edges are rebuilt
/// from field definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceDocument {
    pub tables: Vec<TableMeta>,
    pub fields: Vec<Field>,
    /// Records keyed by table id
    #[serde(default)]
    pub records: BTreeMap<String, Vec<Record>>,
}

impl WorkspaceDocument {
    /// Captures the current snapshot of `db`.
    pub fn from_database(db: &Database) -> Result<Self> {
        let snapshot = db.snapshot();
        let mut records = BTreeMap::new();
        for table in snapshot.tables.values() {
            let fields = snapshot.table_fields(&table.id);
            let mut rows = Vec::new();
            for row in snapshot.data(&table.db_table_name)?.rows.values() {
                let mut record = Record::new(&row.id);
                record.version = row.version;
                for field in &fields {
                    let value = types::decode(field, &row.column(&field.db_field_name))?;
                    if !value.is_null() {
                        record.fields.insert(field.id.clone(), value);
                    }
                }
                rows.push(record);
            }
            records.insert(table.id.clone(), rows);
        }
        Ok(Self {
            tables: snapshot.tables.values().cloned().collect(),
            fields: snapshot.fields.values().cloned().collect(),
            records,
        })
    }

    /// Builds a database holding this document.
    ///
    /// # Returns
    /// `Result<Database>`; fails on unknown tables or fields, records in
    /// the wrong table, values the codec rejects, or dependency cycles.
    pub fn into_database(self) -> Result<Database> {
        let mut snapshot = Snapshot::default();
        for table in self.tables {
            if snapshot.tables.contains_key(&table.id) {
                return Err(RecalcError::TableAlreadyExists(table.id));
            }
            snapshot.data.insert(
                table.db_table_name.clone(),
                Arc::new(TableData::new(&table.db_table_name)),
            );
            snapshot.tables.insert(table.id.clone(), table);
        }

        for field in self.fields {
            snapshot.table(&field.table_id)?;
            if snapshot.fields.contains_key(&field.id) {
                return Err(RecalcError::FieldAlreadyExists(field.id));
            }
            snapshot.fields.insert(field.id.clone(), field);
        }
        let references: BTreeSet<Reference> = snapshot.fields.values().flat_map(references_for).collect();
        let edges: Vec<Reference> = references.iter().cloned().collect();
        for field_id in snapshot.fields.keys() {
            if reaches(field_id, field_id, &edges) {
                return Err(RecalcError::CycleDetected {
                    field: field_id.clone(),
                });
            }
        }
        snapshot.references = references;

        for (table_id, records) in self.records {
            let table = snapshot.table(&table_id)?.clone();
            let mut data = TableData::new(&table.db_table_name);
            for record in records {
                if !types::is_record_id(&record.id) {
                    return Err(RecalcError::InvalidOperation(format!(
                        "'{}' is not a record id",
                        record.id
                    )));
                }
                let mut row = Row::new(&record.id);
                row.version = record.version.max(1);
                for (field_id, value) in &record.fields {
                    let field = snapshot.field(field_id)?;
                    if field.table_id != table_id {
                        return Err(RecalcError::InvalidOperation(format!(
                            "field '{}' does not belong to table '{}'",
                            field_id, table_id
                        )));
                    }
                    let encoded = types::encode(field, value)?;
                    if !encoded.is_null() {
                        row.columns.insert(field.db_field_name.clone(), encoded);
                    }
                }
                data.rows.insert(record.id.clone(), Arc::new(row));
            }
            snapshot.data.insert(table.db_table_name.clone(), Arc::new(data));
        }

        rebuild_foreign_keys(&mut snapshot)?;
        tracing::info!(
            tables = snapshot.tables.len(),
            fields = snapshot.fields.len(),
            "imported workspace document"
        );
        Ok(Database::from_snapshot(snapshot))
    }

    /// Reads a document from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| RecalcError::IoError(format!("Failed to read document: {}", e)))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Writes the document as pretty JSON through a temporary file and an
    /// atomic rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("json.tmp");

        let mut file = File::create(&temp_path)
            .map_err(|e| RecalcError::IoError(format!("Failed to create temp file: {}", e)))?;
        file.write_all(json.as_bytes())
            .map_err(|e| RecalcError::IoError(format!("Failed to write document: {}", e)))?;
        file.sync_all()
            .map_err(|e| RecalcError::IoError(format!("Failed to sync document: {}", e)))?;

        fs::rename(&temp_path, path)
            .map_err(|e| RecalcError::IoError(format!("Failed to rename document: {}", e)))?;
        Ok(())
    }
}

/// Writes the foreign-key column of every link pair from the cells of its
/// many-to-one side.
fn rebuild_foreign_keys(snapshot: &mut Snapshot) -> Result<()> {
    let mut writes: HashMap<String, Vec<(String, String, String)>> = HashMap::new();
    for field in snapshot.fields.values() {
        let Some(options) = field.link_options() else {
            continue;
        };
        if !options.host_is_self() {
            continue;
        }
        let data = snapshot.data(&options.fk_host_table_name)?;
        for row in data.rows.values() {
            let cell = types::decode(field, &row.column(&field.db_field_name))?;
            if let Some(target) = link_ids(&cell).into_iter().next() {
                writes
                    .entry(options.fk_host_table_name.clone())
                    .or_default()
                    .push((row.id.clone(), options.fk_column().to_string(), target));
            }
        }
    }

    for (db_table, rows) in writes {
        let data = snapshot
            .data
            .get_mut(&db_table)
            .ok_or_else(|| RecalcError::TableNotFound {
                table: db_table.clone(),
            })?;
        let data = Arc::make_mut(data);
        for (record_id, column, target) in rows {
            if let Some(row) = data.rows.get_mut(&record_id) {
                Arc::make_mut(row).columns.insert(column, DbValue::Text(target));
            }
        }
    }
    Ok(())
}
