//! Link cascades across the Orders and Customers tables.
//!
//! Every test drives edits through `Recalculator::apply_changes` and checks
//! the committed state plus the returned op-map.

use serde_json::{json, Value};

use recalc_core::table::FieldBuilder;
use recalc_core::types::{CellValueType, DbValue};
use recalc_core::{collector, CellChange, RecalcConfig, RecalcError};

use super::helpers::{
    customer_key, edit, engine_over, linked_engine, op_for, orders_db, value, USER,
};

/// Linking fills the reverse collection, lookups and rollups.
#[test]
fn test_link_populates_both_sides() {
    let engine = linked_engine();

    assert_eq!(customer_key(&engine, "recA1"), DbValue::Text("recX".to_string()));
    assert_eq!(
        value(&engine, "tblA", "recA1", "fldL"),
        json!({"id": "recX", "title": "Xena"})
    );
    assert_eq!(value(&engine, "tblA", "recA1", "fldCustName"), json!("Xena"));
    assert_eq!(
        value(&engine, "tblB", "recX", "fldS"),
        json!([{"id": "recA1", "title": "A-1"}, {"id": "recA2", "title": "A-2"}])
    );
    assert_eq!(value(&engine, "tblB", "recX", "fldSpent"), json!(15));
    assert_eq!(value(&engine, "tblB", "recX", "fldCodes"), json!(["A-1", "A-2"]));
}

/// Retargeting a many-to-one link moves the foreign key, both reverse
/// collections and every value computed through them.
#[test]
fn test_retarget_many_one() {
    let engine = linked_engine();

    let ops = engine
        .apply_changes(USER, vec![edit("tblA", "recA1", "fldL", json!({"id": "recY"}))])
        .unwrap();

    // Foreign key
    assert_eq!(customer_key(&engine, "recA1"), DbValue::Text("recY".to_string()));
    // Reverse collections
    assert_eq!(
        value(&engine, "tblB", "recX", "fldS"),
        json!([{"id": "recA2", "title": "A-2"}])
    );
    assert_eq!(
        value(&engine, "tblB", "recY", "fldS"),
        json!([{"id": "recA1", "title": "A-1"}])
    );
    // Lookup on the edited side
    assert_eq!(value(&engine, "tblA", "recA1", "fldCustName"), json!("Yuri"));
    // Rollups and lookups on both targets
    assert_eq!(value(&engine, "tblB", "recX", "fldSpent"), json!(5));
    assert_eq!(value(&engine, "tblB", "recY", "fldSpent"), json!(10));
    assert_eq!(value(&engine, "tblB", "recX", "fldCodes"), json!(["A-2"]));
    assert_eq!(value(&engine, "tblB", "recY", "fldCodes"), json!(["A-1"]));

    assert_eq!(
        op_for(&ops, "tblB", "recX", "fldSpent"),
        Some((json!(15), json!(5)))
    );
    assert_eq!(
        op_for(&ops, "tblB", "recY", "fldSpent"),
        Some((Value::Null, json!(10)))
    );
    assert_eq!(
        op_for(&ops, "tblA", "recA1", "fldCustName"),
        Some((json!("Xena"), json!("Yuri")))
    );
    // The untouched order is not in the batch
    assert!(op_for(&ops, "tblA", "recA2", "fldCustName").is_none());
}

/// Clearing a link detaches the record and recomputes the old target.
#[test]
fn test_unlink_many_one() {
    let engine = linked_engine();

    engine
        .apply_changes(USER, vec![edit("tblA", "recA1", "fldL", Value::Null)])
        .unwrap();

    assert_eq!(customer_key(&engine, "recA1"), DbValue::Null);
    assert_eq!(value(&engine, "tblA", "recA1", "fldL"), Value::Null);
    assert_eq!(value(&engine, "tblA", "recA1", "fldCustName"), Value::Null);
    assert_eq!(value(&engine, "tblB", "recX", "fldSpent"), json!(5));
    assert_eq!(value(&engine, "tblB", "recX", "fldCodes"), json!(["A-2"]));
}

/// Adding a record to the one-to-many side steals it from its previous
/// owner.
#[test]
fn test_attach_from_one_many_side() {
    let engine = linked_engine();

    engine
        .apply_changes(USER, vec![edit("tblB", "recY", "fldS", json!([{"id": "recA2"}]))])
        .unwrap();

    assert_eq!(customer_key(&engine, "recA2"), DbValue::Text("recY".to_string()));
    assert_eq!(
        value(&engine, "tblA", "recA2", "fldL"),
        json!({"id": "recY", "title": "Yuri"})
    );
    assert_eq!(value(&engine, "tblA", "recA2", "fldCustName"), json!("Yuri"));
    assert_eq!(
        value(&engine, "tblB", "recY", "fldS"),
        json!([{"id": "recA2", "title": "A-2"}])
    );
    assert_eq!(
        value(&engine, "tblB", "recX", "fldS"),
        json!([{"id": "recA1", "title": "A-1"}])
    );
    assert_eq!(value(&engine, "tblB", "recX", "fldSpent"), json!(10));
    assert_eq!(value(&engine, "tblB", "recY", "fldSpent"), json!(5));
}

/// Renaming a customer refreshes link titles and lookups of every order
/// pointing at it.
#[test]
fn test_rename_refreshes_titles() {
    let engine = linked_engine();

    let ops = engine
        .apply_changes(USER, vec![edit("tblB", "recX", "fldName", json!("Xenia"))])
        .unwrap();

    for order in ["recA1", "recA2"] {
        assert_eq!(
            value(&engine, "tblA", order, "fldL"),
            json!({"id": "recX", "title": "Xenia"})
        );
        assert_eq!(value(&engine, "tblA", order, "fldCustName"), json!("Xenia"));
    }
    assert_eq!(
        op_for(&ops, "tblA", "recA2", "fldCustName"),
        Some((json!("Xena"), json!("Xenia")))
    );
    assert!(op_for(&ops, "tblB", "recY", "fldSpent").is_none());
}

/// Editing an amount flows to the formula on the same record and the
/// rollup on the linked customer.
#[test]
fn test_amount_edit_reaches_formula_and_rollup() {
    let engine = linked_engine();

    let ops = engine
        .apply_changes(USER, vec![edit("tblA", "recA2", "fldAmt", json!(8))])
        .unwrap();

    assert_eq!(value(&engine, "tblA", "recA2", "fldTotal"), json!(16));
    assert_eq!(value(&engine, "tblB", "recX", "fldSpent"), json!(18));
    assert_eq!(
        op_for(&ops, "tblA", "recA2", "fldAmt"),
        Some((json!(5), json!(8)))
    );
    assert_eq!(collector::op_count(&ops), 3);
}

/// A formula over two edited fields is computed once per batch.
#[test]
fn test_formula_over_two_edits_computes_once() {
    let db = orders_db();
    db.create_table_with_id("tblC", "Sheet").unwrap();
    db.create_field(
        "tblC",
        FieldBuilder::raw("P", CellValueType::Number).with_id("fldP").primary(),
    )
    .unwrap();
    db.create_field("tblC", FieldBuilder::raw("Q", CellValueType::Number).with_id("fldQ"))
        .unwrap();
    db.create_field(
        "tblC",
        FieldBuilder::formula("Sum", "{fldP} + {fldQ}", CellValueType::Number).with_id("fldSum"),
    )
    .unwrap();
    db.create_record("tblC", "rec1", []).unwrap();
    let engine = engine_over(db, RecalcConfig::default());

    let ops = engine
        .apply_changes(
            USER,
            vec![
                edit("tblC", "rec1", "fldP", json!(3)),
                edit("tblC", "rec1", "fldQ", json!(4)),
            ],
        )
        .unwrap();

    let record_ops = &ops["tblC"]["rec1"];
    let sums: Vec<_> = record_ops
        .iter()
        .filter(|op| op.field_id() == Some("fldSum"))
        .collect();
    assert_eq!(sums.len(), 1);
    assert_eq!(sums[0].new_value(), json!(7));
    assert_eq!(record_ops.len(), 3);
}

/// Computed cells cannot be edited and a rejected batch leaves no trace.
#[test]
fn test_computed_edit_rejected() {
    let engine = linked_engine();
    let before = engine.database().snapshot().generation;

    let result = engine.apply_changes(
        USER,
        vec![
            edit("tblA", "recA1", "fldAmt", json!(99)),
            edit("tblA", "recA1", "fldTotal", json!(1)),
        ],
    );

    assert!(matches!(result, Err(RecalcError::InvalidOperation(_))));
    assert_eq!(engine.database().snapshot().generation, before);
    assert_eq!(value(&engine, "tblA", "recA1", "fldAmt"), json!(10));
}

/// Links to records that do not exist fail the whole batch.
#[test]
fn test_link_to_missing_record_fails() {
    let engine = linked_engine();

    let result = engine.apply_changes(
        USER,
        vec![edit("tblA", "recA1", "fldL", json!({"id": "recGone"}))],
    );

    assert!(matches!(result, Err(RecalcError::RecordNotFound { .. })));
    assert_eq!(customer_key(&engine, "recA1"), DbValue::Text("recX".to_string()));
}

/// Stale old values in an edit are replaced by the stored value.
#[test]
fn test_stale_old_value_is_rebased() {
    let engine = linked_engine();

    let ops = engine
        .apply_changes(
            USER,
            vec![CellChange::new("tblA", "recA1", "fldAmt", json!(1234), json!(11))],
        )
        .unwrap();

    assert_eq!(
        op_for(&ops, "tblA", "recA1", "fldAmt"),
        Some((json!(10), json!(11)))
    );
}

/// Writing a value equal to the stored one produces no operations.
#[test]
fn test_noop_edit_produces_empty_map() {
    let engine = linked_engine();

    let ops = engine
        .apply_changes(USER, vec![edit("tblB", "recY", "fldName", json!("Yuri"))])
        .unwrap();

    assert!(ops.is_empty());
}

/// Ops carry the value storage holds, not the text the client sent.
#[test]
fn test_date_edit_publishes_stored_value() {
    let engine = linked_engine();
    let db = engine.database();
    db.create_field(
        "tblA",
        FieldBuilder::raw("Due", CellValueType::DateTime).with_id("fldDue"),
    )
    .unwrap();
    db.create_field(
        "tblB",
        FieldBuilder::lookup("Due Dates", "fldS", "fldDue").with_id("fldDues"),
    )
    .unwrap();

    let ops = engine
        .apply_changes(
            USER,
            vec![edit("tblA", "recA1", "fldDue", json!("2024-03-01T10:00:00+02:00"))],
        )
        .unwrap();

    let stored = value(&engine, "tblA", "recA1", "fldDue");
    assert_eq!(stored, json!("2024-03-01T08:00:00.000Z"));
    assert_eq!(op_for(&ops, "tblA", "recA1", "fldDue"), Some((Value::Null, stored)));
    let (_, dues) = op_for(&ops, "tblB", "recX", "fldDues").unwrap();
    assert_eq!(dues, value(&engine, "tblB", "recX", "fldDues"));
}
