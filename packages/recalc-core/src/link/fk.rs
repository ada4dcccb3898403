use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::transaction::Transaction;
use crate::types::DbValue;

/// Pending rewrite of one foreign-key cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FkChange {
    pub old_key: Option<String>,
    pub new_key: Option<String>,
}

impl FkChange {
    pub fn is_noop(&self) -> bool {
        self.old_key == self.new_key
    }
}

/// Foreign-key writes implied by a batch of link edits.
///
/// Keyed by `(host table, column, host record)`. Repeated writes to one
/// key keep the first old key and the last new key.
#[derive(Debug, Clone, Default)]
pub struct ForeignKeyPlan {
    changes: BTreeMap<(String, String, String), FkChange>,
}

impl ForeignKeyPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        host_table: &str,
        column: &str,
        record_id: &str,
        old_key: Option<String>,
        new_key: Option<String>,
    ) {
        let key = (host_table.to_string(), column.to_string(), record_id.to_string());
        match self.changes.entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().new_key = new_key,
            Entry::Vacant(entry) => {
                entry.insert(FkChange { old_key, new_key });
            }
        }
    }

    /// Planned change for one host record, if any.
    pub fn resolve(&self, host_table: &str, column: &str, record_id: &str) -> Option<&FkChange> {
        self.changes
            .get(&(host_table.to_string(), column.to_string(), record_id.to_string()))
    }

    /// Changes in one column, as `(host record, change)`.
    pub fn column_changes<'a>(
        &'a self,
        host_table: &'a str,
        column: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a FkChange)> + 'a {
        self.changes
            .iter()
            .filter(move |((table, col, _), _)| table == host_table && col == column)
            .map(|((_, _, record), change)| (record.as_str(), change))
    }

    pub fn is_empty(&self) -> bool {
        self.changes.values().all(FkChange::is_noop)
    }

    pub fn len(&self) -> usize {
        self.changes.values().filter(|change| !change.is_noop()).count()
    }

    /// Stages every non-trivial key write in `tx`.
    pub fn apply(&self, tx: &mut Transaction) -> Result<usize> {
        let mut written = 0;
        for ((host_table, column, record_id), change) in &self.changes {
            if change.is_noop() {
                continue;
            }
            let value = change
                .new_key
                .as_ref()
                .map_or(DbValue::Null, |key| DbValue::Text(key.clone()));
            tx.stage_write(host_table, record_id, column, value)?;
            written += 1;
        }
        tracing::debug!(written, "applied foreign key plan");
        Ok(written)
    }
}

/// Current key of a host record: the plan's pending key first, then storage.
pub(crate) fn effective_key(
    tx: &Transaction,
    plan: &ForeignKeyPlan,
    host_table: &str,
    column: &str,
    record_id: &str,
) -> Result<Option<String>> {
    if let Some(change) = plan.resolve(host_table, column, record_id) {
        return Ok(change.new_key.clone());
    }
    Ok(match tx.read_column(host_table, record_id, column)? {
        DbValue::Text(key) => Some(key),
        _ => None,
    })
}
