//! Bridge service tests
//!
//! Concurrent edits through the async service, retry on stale versions,
//! and ordering of published bundles.

use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::thread;

use ntest::timeout;
use serde_json::{json, Value};

use recalc_core::table::{FieldBuilder, Relationship};
use recalc_core::types::CellValueType;
use recalc_core::{CellChange, Database, Operation, RecalcConfig, RecalcError, Recalculator};
use recalc_runtime::{ApplyBridge, ApplyEvent, BridgeService, BroadcastPublisher, RuntimeError};

const ORDERS: [&str; 4] = ["recA1", "recA2", "recA3", "recA4"];

/// Four orders linked to one customer whose `Spent` sums their amounts.
fn shop(max_conflict_retries: u32) -> (Arc<ApplyBridge>, Arc<BroadcastPublisher>) {
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
        "tblB",
        FieldBuilder::rollup("Spent", "sum({values})", "fldS", "fldAmt", CellValueType::Number)
            .with_id("fldSpent"),
    )
    .unwrap();
    db.create_record("tblB", "recX", [("fldName", json!("Xena"))]).unwrap();
    for (i, order) in ORDERS.iter().enumerate() {
        db.create_record(
            "tblA",
            order,
            [("fldCode", json!(format!("A-{}", i + 1))), ("fldAmt", json!(1))],
        )
        .unwrap();
    }

    let config = RecalcConfig {
        max_conflict_retries,
        ..RecalcConfig::default()
    };
    let engine = Arc::new(Recalculator::new(Arc::new(db), config));
    engine
        .apply_changes(
            "usrSetup",
            ORDERS
                .iter()
                .map(|order| CellChange::new("tblA", order, "fldL", Value::Null, json!({"id": "recX"})))
                .collect(),
        )
        .unwrap();

    let publisher = Arc::new(BroadcastPublisher::new(1024));
    let bridge = Arc::new(ApplyBridge::new(engine, publisher.clone()));
    (bridge, publisher)
}

fn amount_edit(bridge: &ApplyBridge, order: &str, amount: i64) -> ApplyEvent {
    let version = bridge
        .engine()
        .database()
        .get_record("tblA", order)
        .unwrap()
        .version;
    ApplyEvent::new(
        "tblA",
        order,
        version,
        Operation::set_field("fldAmt", Value::Null, json!(amount)),
    )
}

fn spent(bridge: &ApplyBridge) -> Value {
    bridge
        .engine()
        .database()
        .get_record("tblB", "recX")
        .unwrap()
        .value("fldSpent")
        .clone()
}

/// A single edit round-trips through the service.
#[tokio::test]
async fn test_service_applies_edit() {
    let (bridge, publisher) = shop(3);
    let mut bundles = publisher.subscribe();
    let (handle, task) = BridgeService::spawn(bridge.clone(), 16);

    let outcome = handle
        .apply("usr1", amount_edit(&bridge, "recA1", 10))
        .await
        .unwrap();

    assert_eq!(outcome.op_map["tblB"]["recX"][0].new_value(), json!(13));
    assert_eq!(spent(&bridge), json!(13));
    let bundle = bundles.recv().await.unwrap();
    assert_eq!(bundle.op_map, outcome.op_map);

    drop(handle);
    task.await.unwrap();
}

/// Concurrent edits of different orders all land; the shared rollup ends
/// consistent and bundles arrive in commit order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_edits_retry_and_converge() {
    let (bridge, publisher) = shop(64);
    let mut bundles = publisher.subscribe();
    let (handle, task) = BridgeService::spawn(bridge.clone(), 64);

    let mut calls = Vec::new();
    for round in 0..5i64 {
        for (i, order) in ORDERS.iter().enumerate() {
            let handle = handle.clone();
            let event = amount_edit(&bridge, order, round * 10 + i as i64 + 2);
            calls.push(tokio::spawn(async move { handle.apply("usr1", event).await }));
        }
    }
    let mut retried = 0;
    for call in calls {
        match call.await.unwrap() {
            Ok(outcome) => retried += outcome.retries,
            Err(e) => panic!("edit failed: {e}"),
        }
    }
    drop(handle);
    task.await.unwrap();

    let db = bridge.engine().database();
    let total: i64 = ORDERS
        .iter()
        .map(|order| db.get_record("tblA", order).unwrap().value("fldAmt").as_i64().unwrap())
        .sum();
    assert_eq!(spent(&bridge), json!(total));
    // Five committed edits per order on top of its creation and linking
    for order in ORDERS {
        assert_eq!(db.get_record("tblA", order).unwrap().version, 7);
    }

    let mut last_version = 0;
    while let Ok(bundle) = bundles.try_recv() {
        if let Some(version) = bundle.versions.get("tblB").and_then(|r| r.get("recX")) {
            assert!(*version > last_version);
            last_version = *version;
        }
    }
    assert!(last_version > 0);
    tracing::debug!(retried, "concurrent edits finished");
}

/// A stale edit with retries disabled surfaces the conflict.
#[tokio::test]
async fn test_stale_edit_conflicts_without_retries() {
    let (bridge, _publisher) = shop(0);
    let (handle, task) = BridgeService::spawn(bridge.clone(), 4);

    let stale = amount_edit(&bridge, "recA1", 5);
    handle
        .apply("usr1", amount_edit(&bridge, "recA1", 4))
        .await
        .unwrap();
    let err = handle.apply("usr2", stale).await.unwrap_err();

    assert!(matches!(
        err,
        RuntimeError::Recalc(RecalcError::VersionConflict { .. })
    ));
    assert_eq!(spent(&bridge), json!(7));

    drop(handle);
    task.await.unwrap();
}

/// Bulk requests go through the same service.
#[tokio::test]
async fn test_service_bulk_requests() {
    let (bridge, _publisher) = shop(3);
    let (handle, task) = BridgeService::spawn(bridge.clone(), 4);

    let ops = handle
        .reset_fields("usr1", "tblA", vec!["fldAmt".to_string()])
        .await
        .unwrap();
    assert!(ops.is_empty());

    let err = handle
        .calculate_fields_by_record_ids("usr1", "tblA", vec!["recNope".to_string()])
        .await
        .unwrap_err();
    assert!(err.as_recalc().is_some_and(RecalcError::is_not_found));

    drop(handle);
    task.await.unwrap();
}

/// Racing writers on blocking threads: every edit commits after
/// transparently retrying.
#[timeout(10000)]
#[test]
fn test_racing_threads_retry_transparently() {
    let (bridge, _publisher) = shop(64);

    let handles: Vec<_> = ORDERS
        .iter()
        .enumerate()
        .map(|(i, order)| {
            let bridge = Arc::clone(&bridge);
            let order = order.to_string();
            thread::spawn(move || {
                for round in 0..10i64 {
                    let event = amount_edit(&bridge, &order, round * 10 + i as i64 + 2);
                    bridge.apply("usr1", &event).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(spent(&bridge), json!(92 + 93 + 94 + 95));
}

/// A bulk recomputation racing writers commits once, and every record's
/// versions reach subscribers in increasing order.
#[timeout(10000)]
#[test]
fn test_bulk_racing_writers_publishes_in_commit_order() {
    let (bridge, publisher) = shop(64);
    let mut bundles = publisher.subscribe();
    bridge
        .engine()
        .database()
        .create_field(
            "tblA",
            FieldBuilder::formula("Double", "{fldAmt} * 2", CellValueType::Number).with_id("fldDouble"),
        )
        .unwrap();

    let start = Arc::new(Barrier::new(ORDERS.len() + 1));
    let writers: Vec<_> = ORDERS
        .iter()
        .enumerate()
        .map(|(i, order)| {
            let bridge = Arc::clone(&bridge);
            let start = Arc::clone(&start);
            let order = order.to_string();
            thread::spawn(move || {
                start.wait();
                for round in 0..5i64 {
                    let event = amount_edit(&bridge, &order, round * 10 + i as i64 + 2);
                    bridge.apply("usrWriter", &event).unwrap();
                }
            })
        })
        .collect();
    start.wait();
    bridge
        .calculate_fields("usrBulk", "tblA", &["fldDouble".to_string()])
        .unwrap();
    for writer in writers {
        writer.join().unwrap();
    }

    let mut last_seen: BTreeMap<String, u64> = BTreeMap::new();
    while let Ok(bundle) = bundles.try_recv() {
        for (record, version) in bundle.versions.get("tblA").into_iter().flatten() {
            let last = last_seen.entry(record.clone()).or_default();
            assert!(*version > *last, "{record} went from {last} to {version}");
            *last = *version;
        }
    }
    let db = bridge.engine().database();
    for order in ORDERS {
        let record = db.get_record("tblA", order).unwrap();
        assert_eq!(last_seen[order], record.version);
        let amount = record.value("fldAmt").as_i64().unwrap();
        assert_eq!(record.value("fldDouble"), &json!(amount * 2));
    }
}
