use std::collections::BTreeSet;

use serde_json::Value;

use crate::error::{RecalcError, Result};
use crate::table::{Field, LinkOptions};
use crate::transaction::Transaction;
use crate::types::DbValue;

use super::{link_ids, ForeignKeyPlan};

pub(crate) fn options_of(field: &Field) -> Result<&LinkOptions> {
    field.link_options().ok_or_else(|| {
        RecalcError::InvalidOperation(format!("field '{}' is not a link field", field.id))
    })
}

/// Resolves the members of a link cell in cell order.
///
/// A listed record stays a member when its foreign key points at the other
/// side of the link or is still unset. A pending key in `plan` overrides
/// storage, so a key the plan clears or retargets drops the record even
/// before the plan is written. Records missing from the foreign table are
/// dropped.
///
/// # Arguments
/// * `tx` - Transaction to read through
/// * `field` - Link field owning the cell
/// * `record_id` - Record holding the cell
/// * `cell` - Link cell value
/// * `plan` - Foreign-key writes pending in this cascade
///
/// # Returns
/// `Result<Vec<String>>` with member record ids.
pub fn resolve_linked_ids(
    tx: &Transaction,
    field: &Field,
    record_id: &str,
    cell: &Value,
    plan: &ForeignKeyPlan,
) -> Result<Vec<String>> {
    let options = options_of(field)?;
    let snapshot = tx.snapshot().clone();
    let foreign = snapshot.table(&options.foreign_table_id)?;
    let host = options.fk_host_table_name.as_str();
    let column = options.fk_column();

    let mut members = Vec::new();
    for id in link_ids(cell) {
        if !tx.record_exists(&foreign.db_table_name, &id) {
            tracing::debug!(field = %field.id, record = %id, "dropping dangling link");
            continue;
        }
        let (host_record, expected) = if options.host_is_self() {
            (record_id, id.as_str())
        } else {
            (id.as_str(), record_id)
        };
        let member = match plan.resolve(host, column, host_record) {
            Some(change) => change.new_key.as_deref() == Some(expected),
            None => match tx.read_column(host, host_record, column)? {
                DbValue::Text(key) => key == expected,
                _ => true,
            },
        };
        if member {
            members.push(id);
        }
    }
    Ok(members)
}

/// Finds records of `field`'s table whose link reaches any of `foreign_ids`,
/// before or after the pending `plan`.
pub fn records_linking_to(
    tx: &Transaction,
    field: &Field,
    foreign_ids: &BTreeSet<String>,
    plan: &ForeignKeyPlan,
) -> Result<BTreeSet<String>> {
    let options = options_of(field)?;
    let host = options.fk_host_table_name.as_str();
    let column = options.fk_column();
    let touches = |key: &Option<String>| key.as_ref().is_some_and(|k| foreign_ids.contains(k));

    let mut found = BTreeSet::new();
    if options.host_is_self() {
        for (record_id, _) in tx.find_by_column(host, column, foreign_ids)? {
            found.insert(record_id);
        }
        for (record_id, change) in plan.column_changes(host, column) {
            if touches(&change.old_key) || touches(&change.new_key) {
                found.insert(record_id.to_string());
            }
        }
    } else {
        for foreign_id in foreign_ids {
            if !tx.record_exists(host, foreign_id) {
                continue;
            }
            if let DbValue::Text(owner) = tx.read_column(host, foreign_id, column)? {
                found.insert(owner);
            }
            if let Some(change) = plan.resolve(host, column, foreign_id) {
                found.extend(change.old_key.iter().cloned());
                found.extend(change.new_key.iter().cloned());
            }
        }
    }
    Ok(found)
}
