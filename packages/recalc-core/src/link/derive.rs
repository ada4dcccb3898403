use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde_json::Value;

use crate::calc::display_text;
use crate::error::{RecalcError, Result};
use crate::table::Field;
use crate::transaction::{CellChange, Transaction};
use crate::types;

use super::fk::effective_key;
use super::join::options_of;
use super::{is_link_value, link_cell, link_ids, link_items, ForeignKeyPlan, LinkItem};

/// Result of deriving the consequences of link edits.
#[derive(Debug, Clone, Default)]
pub struct LinkDerivation {
    /// Link cell changes on both sides of each pair, already staged
    pub changes: Vec<CellChange>,
    /// Foreign-key writes, not yet staged
    pub plan: ForeignKeyPlan,
}

/// In-memory post-state of every link cell touched by a batch.
#[derive(Default)]
struct Projection {
    cells: BTreeMap<(String, String), Value>,
}

impl Projection {
    fn cell(&mut self, tx: &Transaction, field: &Field, record_id: &str) -> Result<&mut Value> {
        match self.cells.entry((field.id.clone(), record_id.to_string())) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(read_cell(tx, field, record_id)?)),
        }
    }

    fn set(&mut self, field: &Field, record_id: &str, value: Value) {
        self.cells
            .insert((field.id.clone(), record_id.to_string()), value);
    }

    fn detach(&mut self, tx: &Transaction, field: &Field, record_id: &str, target: &str) -> Result<()> {
        let cell = self.cell(tx, field, record_id)?;
        let items: Vec<LinkItem> = link_items(cell)
            .into_iter()
            .filter(|item| item.id != target)
            .collect();
        *cell = link_cell(field, items);
        Ok(())
    }

    fn attach(
        &mut self,
        tx: &Transaction,
        field: &Field,
        record_id: &str,
        target: &str,
        title: Option<String>,
    ) -> Result<()> {
        let cell = self.cell(tx, field, record_id)?;
        let mut items = link_items(cell);
        match items.iter_mut().find(|item| item.id == target) {
            Some(item) => item.title = title,
            None => items.push(LinkItem::new(target, title)),
        }
        *cell = link_cell(field, items);
        Ok(())
    }
}

fn read_cell(tx: &Transaction, field: &Field, record_id: &str) -> Result<Value> {
    let snapshot = tx.snapshot();
    let db_table = &snapshot.table(&field.table_id)?.db_table_name;
    types::decode(field, &tx.read_column(db_table, record_id, &field.db_field_name)?)
}

/// Display title of `target` as shown in cells of the link `field`.
fn title_of(tx: &Transaction, field: &Field, target: &str) -> Result<Option<String>> {
    let options = options_of(field)?;
    let snapshot = tx.snapshot();
    let title_field = snapshot.field(&options.lookup_field_id)?;
    Ok(display_text(&read_cell(tx, title_field, target)?))
}

/// Derives link cell and foreign-key changes for a batch of cell edits.
///
/// Edits must already be staged in `tx`. Non-link edits, and link edits
/// whose old and new values are both not link-shaped, are ignored. The
/// projection of every touched cell is mutated in memory, diffed against
/// the transaction state, and the differences are staged. Foreign keys are
/// returned as a plan so the caller can order their write against
/// dependent recomputation.
pub fn derive_link_changes(tx: &mut Transaction, origin: &[CellChange]) -> Result<LinkDerivation> {
    let snapshot = tx.snapshot().clone();
    let mut projection = Projection::default();
    let mut plan = ForeignKeyPlan::new();

    for change in origin {
        let field = snapshot.field(&change.field_id)?;
        let Some(options) = field.link_options() else {
            continue;
        };
        if !is_link_value(&change.old_value) && !is_link_value(&change.new_value) {
            continue;
        }
        let symmetric = snapshot.field(&options.symmetric_field_id)?;
        let own = snapshot.table(&field.table_id)?;
        let foreign = snapshot.table(&options.foreign_table_id)?;
        let host = options.fk_host_table_name.as_str();
        let column = options.fk_column();
        let record_id = change.record_id.as_str();
        let old_ids = link_ids(&change.old_value);
        let new_ids = link_ids(&change.new_value);

        for id in &new_ids {
            if !tx.record_exists(&foreign.db_table_name, id) {
                return Err(RecalcError::RecordNotFound {
                    table: foreign.id.clone(),
                    record: id.clone(),
                });
            }
        }

        if options.host_is_self() {
            let current = effective_key(tx, &plan, host, column, record_id)?;
            let target = new_ids.first().cloned();
            let mut previous = old_ids.clone();
            if let Some(key) = &current {
                if !previous.contains(key) {
                    previous.push(key.clone());
                }
            }
            for prev in previous.iter().filter(|p| Some(*p) != target.as_ref()) {
                if tx.record_exists(&foreign.db_table_name, prev) {
                    projection.detach(tx, symmetric, prev, record_id)?;
                }
            }
            if let Some(target) = &target {
                let title = title_of(tx, symmetric, record_id)?;
                projection.attach(tx, symmetric, target, record_id, title)?;
            }
            plan.record(host, column, record_id, current, target);
        } else {
            for removed in old_ids.iter().filter(|id| !new_ids.contains(id)) {
                if !tx.record_exists(host, removed) {
                    continue;
                }
                let key = effective_key(tx, &plan, host, column, removed)?;
                if key.is_none() || key.as_deref() == Some(record_id) {
                    plan.record(host, column, removed, key, None);
                    projection.set(symmetric, removed, Value::Null);
                }
            }
            for added in new_ids.iter().filter(|id| !old_ids.contains(id)) {
                let key = effective_key(tx, &plan, host, column, added)?;
                if let Some(previous) = key.as_deref().filter(|p| *p != record_id) {
                    if tx.record_exists(&own.db_table_name, previous) {
                        projection.detach(tx, field, previous, added)?;
                    }
                }
                let title = title_of(tx, symmetric, record_id)?;
                projection.set(
                    symmetric,
                    added,
                    link_cell(symmetric, vec![LinkItem::new(record_id, title)]),
                );
                plan.record(host, column, added, key, Some(record_id.to_string()));
            }
        }

        let items = new_ids
            .iter()
            .map(|id| Ok(LinkItem::new(id, title_of(tx, field, id)?)))
            .collect::<Result<Vec<_>>>()?;
        projection.set(field, record_id, link_cell(field, items));
    }

    let mut changes = Vec::new();
    for ((field_id, record_id), value) in projection.cells {
        let field = snapshot.field(&field_id)?;
        let db_table = &snapshot.table(&field.table_id)?.db_table_name;
        let current = read_cell(tx, field, &record_id)?;
        let (stored, value) = types::canonicalize(field, &value)?;
        if current == value {
            continue;
        }
        tx.stage_write(db_table, &record_id, &field.db_field_name, stored)?;
        changes.push(CellChange::new(&field.table_id, &record_id, &field_id, current, value));
    }

    tracing::debug!(
        cells = changes.len(),
        fk_writes = plan.len(),
        "derived link changes"
    );
    Ok(LinkDerivation { changes, plan })
}
