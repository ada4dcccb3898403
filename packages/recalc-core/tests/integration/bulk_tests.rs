//! Table-wide recompute, reset and per-record recompute.

use serde_json::{json, Value};

use recalc_core::table::FieldBuilder;
use recalc_core::types::{CellValueType, DbValue};
use recalc_core::{RecalcConfig, RecalcError, WorkspaceDocument};

use super::helpers::{corrupt, edit, engine_over, linked_engine, op_for, orders_db, value, USER};

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// A formula added after its inputs is filled in for every record, one
/// page at a time.
#[test]
fn test_calculate_new_field_across_pages() {
    let engine = engine_over(
        orders_db(),
        RecalcConfig {
            page_size: 1,
            ..RecalcConfig::default()
        },
    );
    engine
        .database()
        .create_field(
            "tblA",
            FieldBuilder::formula("Tax", "{fldAmt} / 10.0", CellValueType::Number).with_id("fldTax"),
        )
        .unwrap();

    let ops = engine
        .calculate_fields(USER, "tblA", &ids(&["fldTax"]))
        .unwrap();

    assert_eq!(value(&engine, "tblA", "recA1", "fldTax"), json!(1));
    assert_eq!(value(&engine, "tblA", "recA2", "fldTax"), json!(0.5));
    assert_eq!(ops["tblA"].len(), 2);
    assert_eq!(
        op_for(&ops, "tblA", "recA2", "fldTax"),
        Some((Value::Null, json!(0.5)))
    );
}

/// Recompute skips raw fields; reset of a raw field refreshes its
/// dependents.
#[test]
fn test_reset_refreshes_dependents_of_raw_field() {
    let engine = linked_engine();
    corrupt(engine.database(), "tblA", "recA1", "fldTotal", DbValue::Integer(-1));

    let ops = engine
        .calculate_fields(USER, "tblA", &ids(&["fldAmt"]))
        .unwrap();
    assert!(ops.is_empty());
    assert_eq!(value(&engine, "tblA", "recA1", "fldTotal"), json!(-1));

    let ops = engine.reset_fields(USER, "tblA", &ids(&["fldAmt"])).unwrap();
    assert_eq!(value(&engine, "tblA", "recA1", "fldTotal"), json!(20));
    assert_eq!(value(&engine, "tblA", "recA2", "fldTotal"), json!(10));
    assert_eq!(
        op_for(&ops, "tblA", "recA1", "fldTotal"),
        Some((json!(-1), json!(20)))
    );
    // Rollups reading the reset field are rechecked and already agree
    assert!(op_for(&ops, "tblB", "recX", "fldSpent").is_none());
}

/// Recomputing a drifted rollup also repairs what reads it.
#[test]
fn test_calculate_repairs_drifted_rollup() {
    let engine = linked_engine();
    engine
        .database()
        .create_field(
            "tblB",
            FieldBuilder::formula("Spent x2", "{fldSpent} * 2", CellValueType::Number)
                .with_id("fldDouble"),
        )
        .unwrap();
    corrupt(engine.database(), "tblB", "recX", "fldSpent", DbValue::Integer(0));

    let ops = engine
        .calculate_fields(USER, "tblB", &ids(&["fldSpent"]))
        .unwrap();

    assert_eq!(value(&engine, "tblB", "recX", "fldSpent"), json!(15));
    assert_eq!(value(&engine, "tblB", "recX", "fldDouble"), json!(30));
    assert_eq!(
        op_for(&ops, "tblB", "recX", "fldSpent"),
        Some((json!(0), json!(15)))
    );
}

/// Per-record recompute touches only the named records and their readers.
#[test]
fn test_calculate_by_record_ids() {
    let engine = linked_engine();
    corrupt(engine.database(), "tblA", "recA1", "fldCustName", DbValue::Text("stale".to_string()));
    corrupt(engine.database(), "tblA", "recA2", "fldCustName", DbValue::Text("stale".to_string()));

    let ops = engine
        .calculate_fields_by_record_ids(USER, "tblA", &ids(&["recA1"]))
        .unwrap();

    assert_eq!(value(&engine, "tblA", "recA1", "fldCustName"), json!("Xena"));
    assert_eq!(value(&engine, "tblA", "recA2", "fldCustName"), json!("stale"));
    assert_eq!(value(&engine, "tblA", "recA1", "fldTotal"), json!(20));
    assert!(ops["tblA"].get("recA2").is_none());
}

/// Unknown records and foreign fields are rejected before any write.
#[test]
fn test_bulk_input_validation() {
    let engine = linked_engine();

    let result = engine.calculate_fields_by_record_ids(USER, "tblA", &ids(&["recNope"]));
    assert!(matches!(result, Err(RecalcError::RecordNotFound { .. })));

    let result = engine.calculate_fields(USER, "tblA", &ids(&["fldSpent"]));
    assert!(matches!(result, Err(RecalcError::InvalidOperation(_))));

    let result = engine.reset_fields(USER, "tblZ", &ids(&["fldAmt"]));
    assert!(matches!(result, Err(RecalcError::TableNotFound { .. })));
}

/// Reverse-link membership when the stored cells disagree with the
/// foreign keys: a listed record counts while its key points back or is
/// unset, and dangling ids are ignored.
#[test]
fn test_membership_follows_foreign_keys() {
    let db = orders_db();
    db.create_record("tblA", "recA3", [("fldCode", json!("A-3")), ("fldAmt", json!(7))])
        .unwrap();
    let mut document = WorkspaceDocument::from_database(&db).unwrap();
    {
        let orders = document.records.get_mut("tblA").unwrap();
        let order = orders.iter_mut().find(|r| r.id == "recA1").unwrap();
        order.fields.insert("fldL".to_string(), json!({"id": "recY"}));
    }
    {
        let customers = document.records.get_mut("tblB").unwrap();
        let x = customers.iter_mut().find(|r| r.id == "recX").unwrap();
        x.fields.insert(
            "fldS".to_string(),
            json!([{"id": "recA1"}, {"id": "recA3"}, {"id": "recGhost"}]),
        );
        let y = customers.iter_mut().find(|r| r.id == "recY").unwrap();
        y.fields.insert("fldS".to_string(), json!([{"id": "recA1"}]));
    }
    let engine = engine_over(document.into_database().unwrap(), RecalcConfig::default());

    engine
        .calculate_fields(USER, "tblB", &ids(&["fldSpent", "fldCodes"]))
        .unwrap();

    // recA1 points at Yuri; recA3 has no key yet
    assert_eq!(value(&engine, "tblB", "recX", "fldSpent"), json!(7));
    assert_eq!(value(&engine, "tblB", "recX", "fldCodes"), json!(["A-3"]));
    assert_eq!(value(&engine, "tblB", "recY", "fldSpent"), json!(10));
}

/// An empty reverse collection looks up to null and sums to zero.
#[test]
fn test_empty_link_aggregates() {
    let engine = engine_over(orders_db(), RecalcConfig::default());

    engine
        .calculate_fields(USER, "tblB", &ids(&["fldSpent", "fldCodes"]))
        .unwrap();

    assert_eq!(value(&engine, "tblB", "recY", "fldSpent"), json!(0));
    assert_eq!(value(&engine, "tblB", "recY", "fldCodes"), Value::Null);
}

/// Documents written after a cascade reload into an equivalent database.
#[test]
fn test_document_round_trip_after_cascade() {
    let engine = linked_engine();
    engine
        .apply_changes(USER, vec![edit("tblA", "recA1", "fldL", json!({"id": "recY"}))])
        .unwrap();

    let document = WorkspaceDocument::from_database(engine.database()).unwrap();
    let json = serde_json::to_string(&document).unwrap();
    let restored: WorkspaceDocument = serde_json::from_str(&json).unwrap();
    let db = restored.into_database().unwrap();

    for (table, record) in [("tblA", "recA1"), ("tblA", "recA2"), ("tblB", "recX"), ("tblB", "recY")] {
        assert_eq!(
            db.get_record(table, record).unwrap(),
            engine.database().get_record(table, record).unwrap()
        );
    }
}
