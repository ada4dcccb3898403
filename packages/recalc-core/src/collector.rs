//! Change collection: deduplication and op-map composition.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transaction::CellChange;

/// Path segment addressing a record's field map.
pub const FIELDS_PATH: &str = "fields";

/// A single field-set operation on one record document.
///
/// `od` is the value being replaced and `oi` the value inserted; a null
/// cell is an absent side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub p: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub od: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oi: Option<Value>,
}

fn present(value: Value) -> Option<Value> {
    (!value.is_null()).then_some(value)
}

impl Operation {
    /// Operation setting `field_id` from `old` to `new`.
    pub fn set_field(field_id: &str, old: Value, new: Value) -> Self {
        Self {
            p: vec![FIELDS_PATH.to_string(), field_id.to_string()],
            od: present(old),
            oi: present(new),
        }
    }

    /// Field targeted by a field-set operation.
    pub fn field_id(&self) -> Option<&str> {
        match self.p.as_slice() {
            [head, field_id] if head == FIELDS_PATH => Some(field_id.as_str()),
            _ => None,
        }
    }

    pub fn old_value(&self) -> Value {
        self.od.clone().unwrap_or(Value::Null)
    }

    pub fn new_value(&self) -> Value {
        self.oi.clone().unwrap_or(Value::Null)
    }

    pub fn is_noop(&self) -> bool {
        self.od == self.oi
    }
}

/// Operations grouped by table id, then record id.
pub type OpMap = BTreeMap<String, BTreeMap<String, Vec<Operation>>>;

/// Collapses repeated changes to one cell: the first old value and the last
/// new value win. Changes that end where they started are dropped.
/// Surviving changes keep the order in which their cell was first touched.
pub fn merge_duplicate_change(changes: Vec<CellChange>) -> Vec<CellChange> {
    let mut merged: Vec<CellChange> = Vec::with_capacity(changes.len());
    let mut index: HashMap<(String, String, String), usize> = HashMap::new();
    for change in changes {
        let key = (
            change.table_id.clone(),
            change.record_id.clone(),
            change.field_id.clone(),
        );
        match index.get(&key) {
            Some(&at) => merged[at].new_value = change.new_value,
            None => {
                index.insert(key, merged.len());
                merged.push(change);
            }
        }
    }
    merged.retain(|change| !change.is_noop());
    merged
}

/// Groups changes into an op-map.
///
/// Callers merge duplicates first; a repeated cell yields one operation per
/// change.
pub fn format_changes_to_ops(changes: &[CellChange]) -> OpMap {
    let mut map = OpMap::new();
    for change in changes {
        map.entry(change.table_id.clone())
            .or_default()
            .entry(change.record_id.clone())
            .or_default()
            .push(Operation::set_field(
                &change.field_id,
                change.old_value.clone(),
                change.new_value.clone(),
            ));
    }
    map
}

/// Composes two op-maps applied one after the other.
///
/// Per `(table, record, path)` the result replaces the earliest `od` with
/// the latest `oi`; entries whose composed `od` equals `oi` are dropped, and
/// so are records and tables left empty. Operations of a record are ordered
/// by path.
pub fn compose_op_maps(first: &OpMap, second: &OpMap) -> OpMap {
    let mut composed: BTreeMap<(&str, &str), BTreeMap<&[String], Operation>> = BTreeMap::new();
    for map in [first, second] {
        for (table_id, records) in map {
            for (record_id, ops) in records {
                let by_path = composed
                    .entry((table_id.as_str(), record_id.as_str()))
                    .or_default();
                for op in ops {
                    by_path
                        .entry(op.p.as_slice())
                        .and_modify(|existing| existing.oi = op.oi.clone())
                        .or_insert_with(|| op.clone());
                }
            }
        }
    }

    let mut result = OpMap::new();
    for ((table_id, record_id), by_path) in composed {
        let ops: Vec<Operation> = by_path.into_values().filter(|op| !op.is_noop()).collect();
        if !ops.is_empty() {
            result
                .entry(table_id.to_string())
                .or_default()
                .insert(record_id.to_string(), ops);
        }
    }
    result
}

/// Flattens an op-map back into cell changes.
pub fn op_map_changes(map: &OpMap) -> Vec<CellChange> {
    let mut changes = Vec::new();
    for (table_id, records) in map {
        for (record_id, ops) in records {
            for op in ops {
                if let Some(field_id) = op.field_id() {
                    changes.push(CellChange::new(
                        table_id,
                        record_id,
                        field_id,
                        op.old_value(),
                        op.new_value(),
                    ));
                }
            }
        }
    }
    changes
}

/// Counts operations across every table and record.
pub fn op_count(map: &OpMap) -> usize {
    map.values()
        .flat_map(|records| records.values())
        .map(Vec::len)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn change(record: &str, field: &str, old: Value, new: Value) -> CellChange {
        CellChange::new("tblA", record, field, old, new)
    }

    fn single(record: &str, field: &str, od: Value, oi: Value) -> OpMap {
        format_changes_to_ops(&[change(record, field, od, oi)])
    }

    #[test]
    fn test_merge_keeps_first_old_and_last_new() {
        let merged = merge_duplicate_change(vec![
            change("rec1", "fldF", json!("A"), json!("C")),
            change("rec2", "fldF", json!(1), json!(2)),
            change("rec1", "fldF", json!("A"), json!("D")),
        ]);
        assert_eq!(
            merged,
            vec![
                change("rec1", "fldF", json!("A"), json!("D")),
                change("rec2", "fldF", json!(1), json!(2)),
            ]
        );
    }

    #[test]
    fn test_merge_drops_round_trips() {
        let merged = merge_duplicate_change(vec![
            change("rec1", "fldF", json!(1), json!(2)),
            change("rec1", "fldF", json!(2), json!(1)),
        ]);
        assert!(merged.is_empty());
    }

    #[test]
    fn test_operation_shape() {
        let op = Operation::set_field("fldF", Value::Null, json!(3));
        assert_eq!(serde_json::to_value(&op).unwrap(), json!({"p": ["fields", "fldF"], "oi": 3}));
        assert_eq!(op.field_id(), Some("fldF"));
        assert_eq!(op.old_value(), Value::Null);
    }

    #[test]
    fn test_format_groups_by_table_and_record() {
        let map = format_changes_to_ops(&[
            CellChange::new("tblA", "rec1", "fldF", json!(1), json!(2)),
            CellChange::new("tblA", "rec1", "fldG", json!(1), json!(2)),
            CellChange::new("tblB", "rec9", "fldH", Value::Null, json!("x")),
        ]);
        assert_eq!(map.len(), 2);
        assert_eq!(map["tblA"]["rec1"].len(), 2);
        assert_eq!(op_count(&map), 3);
        assert_eq!(op_map_changes(&map).len(), 3);
    }

    #[test]
    fn test_compose_keeps_earliest_before_and_latest_after() {
        let composed = compose_op_maps(
            &single("rec1", "fldF", json!("A"), json!("B")),
            &single("rec1", "fldF", json!("B"), json!("C")),
        );
        assert_eq!(composed, single("rec1", "fldF", json!("A"), json!("C")));
    }

    #[test]
    fn test_compose_with_inverse_is_empty() {
        let forward = single("rec1", "fldF", json!("A"), json!("B"));
        let backward = single("rec1", "fldF", json!("B"), json!("A"));
        assert!(compose_op_maps(&forward, &backward).is_empty());

        let noop = single("rec1", "fldF", json!("A"), json!("A"));
        assert!(compose_op_maps(&noop, &noop).is_empty());
    }

    /// Three consecutive writes per cell, drawn from a small value pool.
    fn chained_maps() -> impl Strategy<Value = (OpMap, OpMap, OpMap)> {
        let cell = (0..3usize, 0..3usize, proptest::collection::vec(0..3i64, 4));
        proptest::collection::vec(cell, 1..6).prop_map(|cells| {
            let mut maps = (OpMap::new(), OpMap::new(), OpMap::new());
            let mut seen = std::collections::BTreeSet::new();
            for (record, field, values) in cells {
                if !seen.insert((record, field)) {
                    continue;
                }
                let record = format!("rec{}", record);
                let field = format!("fld{}", field);
                let v = |i: usize| json!(values[i]);
                for (slot, map) in [&mut maps.0, &mut maps.1, &mut maps.2].into_iter().enumerate() {
                    map.entry("tblA".to_string())
                        .or_default()
                        .entry(record.clone())
                        .or_default()
                        .push(Operation::set_field(&field, v(slot), v(slot + 1)));
                }
            }
            maps
        })
    }

    proptest! {
        #[test]
        fn prop_compose_is_associative((a, b, c) in chained_maps()) {
            let left = compose_op_maps(&compose_op_maps(&a, &b), &c);
            let right = compose_op_maps(&a, &compose_op_maps(&b, &c));
            prop_assert_eq!(left, right);
        }
    }
}
