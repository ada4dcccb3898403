//! Batched record loading through a transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{RecalcError, Result};
use crate::metadata::AuxiliaryData;
use crate::table::Record;
use crate::transaction::Transaction;
use crate::types;

/// Why a record is being loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadClass {
    /// Records whose fields are being recomputed; must exist
    Origin,
    /// Records reached through a link from an origin record
    Related,
    /// Records read only for their values
    Dependency,
}

/// Records of one table and the fields to decode for them.
#[derive(Debug, Clone)]
pub struct RecordLoadRequest {
    pub table_id: String,
    pub record_ids: Vec<String>,
    pub field_ids: Vec<String>,
    pub class: LoadClass,
}

/// Decoded records grouped by table id.
#[derive(Debug, Clone, Default)]
pub struct LoadedRecords {
    by_table: HashMap<String, BTreeMap<String, Record>>,
}

impl LoadedRecords {
    pub fn get(&self, table_id: &str, record_id: &str) -> Option<&Record> {
        self.by_table.get(table_id)?.get(record_id)
    }

    pub fn table(&self, table_id: &str) -> impl Iterator<Item = &Record> {
        self.by_table.get(table_id).into_iter().flat_map(|records| records.values())
    }

    pub fn len(&self) -> usize {
        self.by_table.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct MergedRequest {
    record_ids: BTreeSet<String>,
    field_ids: BTreeSet<String>,
    class: LoadClass,
}

/// Loads every requested record once, however many requests name it.
///
/// Requests for the same table are merged: record and field sets are
/// unioned and the strictest class wins. Missing origin records fail the
/// load; missing related or dependency records are skipped as dangling.
///
/// # Arguments
/// * `tx` - Transaction to read through
/// * `aux` - Metadata for every requested field
/// * `requests` - Load requests
///
/// # Returns
/// `Result<LoadedRecords>` with decoded values.
pub fn load_records_batch(
    tx: &Transaction,
    aux: &AuxiliaryData,
    requests: &[RecordLoadRequest],
) -> Result<LoadedRecords> {
    let mut merged: BTreeMap<&str, MergedRequest> = BTreeMap::new();
    for request in requests {
        let entry = merged
            .entry(request.table_id.as_str())
            .or_insert_with(|| MergedRequest {
                record_ids: BTreeSet::new(),
                field_ids: BTreeSet::new(),
                class: request.class,
            });
        entry.class = entry.class.min(request.class);
        entry.field_ids.extend(request.field_ids.iter().cloned());
        if request.class == LoadClass::Origin {
            for record_id in &request.record_ids {
                let db_table = aux.db_table(&request.table_id)?;
                if !tx.record_exists(db_table, record_id) {
                    return Err(RecalcError::RecordNotFound {
                        table: request.table_id.clone(),
                        record: record_id.clone(),
                    });
                }
            }
        }
        entry.record_ids.extend(request.record_ids.iter().cloned());
    }

    let mut loaded = LoadedRecords::default();
    for (table_id, request) in merged {
        let db_table = aux.db_table(table_id)?;
        let fields = request
            .field_ids
            .iter()
            .map(|field_id| aux.field(field_id))
            .collect::<Result<Vec<_>>>()?;
        let records = loaded.by_table.entry(table_id.to_string()).or_default();
        for record_id in request.record_ids {
            let version = match tx.record_version(db_table, &record_id) {
                Ok(version) => version,
                Err(RecalcError::RecordNotFound { .. }) => {
                    tracing::debug!(table = table_id, record = %record_id, "skipping dangling record");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut record = Record::new(&record_id);
            record.version = version;
            for field in &fields {
                let raw = tx.read_column(db_table, &record_id, &field.db_field_name)?;
                record
                    .fields
                    .insert(field.id.clone(), types::decode(field, &raw)?);
            }
            records.insert(record_id, record);
        }
    }
    Ok(loaded)
}

/// Walks a table's record ids in fixed-size pages.
///
/// Ids are listed once, on the first page, so records created by the
/// walk itself are not revisited.
#[derive(Debug)]
pub struct RecordPager {
    db_table: String,
    page_size: usize,
    offset: usize,
    ids: Option<Vec<String>>,
}

impl RecordPager {
    pub fn new(db_table: &str, page_size: usize) -> Self {
        Self {
            db_table: db_table.to_string(),
            page_size: page_size.max(1),
            offset: 0,
            ids: None,
        }
    }

    /// Returns the next page, or `None` once every id was returned.
    pub fn next_page(&mut self, tx: &Transaction) -> Result<Option<Vec<String>>> {
        if self.ids.is_none() {
            self.ids = Some(tx.record_ids(&self.db_table)?);
        }
        let ids = self.ids.as_deref().unwrap_or_default();
        if self.offset >= ids.len() {
            return Ok(None);
        }
        let end = (self.offset + self.page_size).min(ids.len());
        let page = ids[self.offset..end].to_vec();
        self.offset = end;
        Ok(Some(page))
    }
}
