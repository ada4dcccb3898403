//! Shared fixtures: an Orders table linked many-to-one to Customers.
//!
//! Orders (tblA): Code (primary), Amount, Customer link (fldL), Customer
//! name lookup (fldCustName), Total formula (fldTotal).
//! Customers (tblB): Name (primary), Orders reverse link (fldS), Spent
//! rollup (fldSpent), Codes lookup (fldCodes).

use std::sync::Arc;

use serde_json::{json, Value};

use recalc_core::table::{FieldBuilder, Relationship};
use recalc_core::types::{CellValueType, DbValue};
use recalc_core::{CellChange, Database, OpMap, RecalcConfig, Recalculator};

pub const USER: &str = "usrTest";

/// Builds the schema and raw records without any links.
pub fn orders_db() -> Database {
    let db = Database::new();
    db.create_table_with_id("tblA", "Orders").unwrap();
    db.create_table_with_id("tblB", "Customers").unwrap();
    db.create_field(
        "tblA",
        FieldBuilder::raw("Code", CellValueType::String)
            .with_id("fldCode")
            .primary(),
    )
    .unwrap();
    db.create_field(
        "tblA",
        FieldBuilder::raw("Amount", CellValueType::Number).with_id("fldAmt"),
    )
    .unwrap();
    db.create_field(
        "tblB",
        FieldBuilder::raw("Name", CellValueType::String)
            .with_id("fldName")
            .primary(),
    )
    .unwrap();
    db.create_field(
        "tblA",
        FieldBuilder::link("Customer", Relationship::ManyOne, "tblB")
            .with_id("fldL")
            .with_symmetric_id("fldS"),
    )
    .unwrap();
    db.create_field(
        "tblA",
        FieldBuilder::lookup("Customer Name", "fldL", "fldName").with_id("fldCustName"),
    )
    .unwrap();
    db.create_field(
        "tblA",
        FieldBuilder::formula("Total", "{fldAmt} * 2", CellValueType::Number).with_id("fldTotal"),
    )
    .unwrap();
    db.create_field(
        "tblB",
        FieldBuilder::rollup("Spent", "sum({values})", "fldS", "fldAmt", CellValueType::Number)
            .with_id("fldSpent"),
    )
    .unwrap();
    db.create_field(
        "tblB",
        FieldBuilder::lookup("Codes", "fldS", "fldCode").with_id("fldCodes"),
    )
    .unwrap();

    db.create_record("tblA", "recA1", [("fldCode", json!("A-1")), ("fldAmt", json!(10))])
        .unwrap();
    db.create_record("tblA", "recA2", [("fldCode", json!("A-2")), ("fldAmt", json!(5))])
        .unwrap();
    db.create_record("tblB", "recX", [("fldName", json!("Xena"))]).unwrap();
    db.create_record("tblB", "recY", [("fldName", json!("Yuri"))]).unwrap();
    db
}

pub fn engine_over(db: Database, config: RecalcConfig) -> Recalculator {
    Recalculator::new(Arc::new(db), config)
}

/// Engine over [`orders_db`] with both orders linked to Xena.
pub fn linked_engine() -> Recalculator {
    let engine = engine_over(orders_db(), RecalcConfig::default());
    engine
        .apply_changes(
            USER,
            vec![
                edit("tblA", "recA1", "fldL", json!({"id": "recX"})),
                edit("tblA", "recA2", "fldL", json!({"id": "recX"})),
            ],
        )
        .unwrap();
    engine
}

/// Edit whose old value is re-read by the engine.
pub fn edit(table: &str, record: &str, field: &str, value: Value) -> CellChange {
    CellChange::new(table, record, field, Value::Null, value)
}

pub fn value(engine: &Recalculator, table: &str, record: &str, field: &str) -> Value {
    engine
        .database()
        .get_record(table, record)
        .unwrap()
        .value(field)
        .clone()
}

/// Stored foreign key of an order's Customer link.
pub fn customer_key(engine: &Recalculator, order: &str) -> DbValue {
    let snapshot = engine.database().snapshot();
    let table = snapshot.table("tblA").unwrap();
    snapshot
        .data(&table.db_table_name)
        .unwrap()
        .get(order)
        .unwrap()
        .column("__fk_fldL")
}

/// `(old, new)` of the operation on `field` in an op-map, if any.
pub fn op_for(map: &OpMap, table: &str, record: &str, field: &str) -> Option<(Value, Value)> {
    map.get(table)?
        .get(record)?
        .iter()
        .find(|op| op.field_id() == Some(field))
        .map(|op| (op.old_value(), op.new_value()))
}

/// Overwrites a cell behind the engine's back.
pub fn corrupt(db: &Database, table_id: &str, record: &str, field_id: &str, value: DbValue) {
    let mut tx = db.begin_transaction();
    let snapshot = tx.snapshot().clone();
    let table = snapshot.table(table_id).unwrap();
    let field = snapshot.field(field_id).unwrap();
    tx.stage_write(&table.db_table_name, record, &field.db_field_name, value)
        .unwrap();
    db.commit(&mut tx, "usrAdmin").unwrap();
}
