//! Concurrent writers against one database.

use std::sync::Arc;
use std::thread;

use ntest::timeout;
use serde_json::json;

use recalc_core::{CalcContext, RecalcError};

use super::helpers::{edit, linked_engine, value, USER};

/// Two cascades built on the same snapshot: the second commit is stale.
#[timeout(5000)]
#[test]
fn test_racing_cascades_conflict() {
    let engine = linked_engine();
    let db = engine.database().clone();

    let mut first = db.begin_transaction();
    let mut second = db.begin_transaction();
    {
        let mut ctx = CalcContext::new("usrOne", &mut first);
        engine
            .run_cascade(&mut ctx, vec![edit("tblA", "recA1", "fldAmt", json!(20))])
            .unwrap();
    }
    {
        let mut ctx = CalcContext::new("usrTwo", &mut second);
        engine
            .run_cascade(&mut ctx, vec![edit("tblA", "recA2", "fldAmt", json!(1))])
            .unwrap();
    }

    db.commit(&mut first, "usrOne").unwrap();
    // Both cascades rewrote the shared rollup on recX
    let result = db.commit(&mut second, "usrTwo");
    assert!(matches!(result, Err(RecalcError::VersionConflict { .. })));

    assert_eq!(value(&engine, "tblB", "recX", "fldSpent"), json!(25));
    assert_eq!(value(&engine, "tblA", "recA2", "fldAmt"), json!(5));
}

/// A cascade that never commits is invisible to readers.
#[timeout(5000)]
#[test]
fn test_uncommitted_cascade_is_invisible() {
    let engine = linked_engine();
    let mut tx = engine.database().begin_transaction();
    {
        let mut ctx = CalcContext::new(USER, &mut tx);
        let changes = engine
            .run_cascade(&mut ctx, vec![edit("tblA", "recA1", "fldAmt", json!(100))])
            .unwrap();
        assert!(changes.iter().any(|c| c.field_id == "fldSpent"));
    }
    tx.abort();

    assert_eq!(value(&engine, "tblA", "recA1", "fldAmt"), json!(10));
    assert_eq!(value(&engine, "tblB", "recX", "fldSpent"), json!(15));
}

/// Writers on disjoint records commit in parallel; readers always see a
/// consistent rollup.
#[timeout(10000)]
#[test]
fn test_parallel_writers_keep_rollups_consistent() {
    let engine = Arc::new(linked_engine());

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut committed = 0usize;
                for round in 0..25 {
                    let order = if i % 2 == 0 { "recA1" } else { "recA2" };
                    let amount = json!(i * 100 + round);
                    match engine.apply_changes(USER, vec![edit("tblA", order, "fldAmt", amount)]) {
                        Ok(_) => committed += 1,
                        Err(RecalcError::VersionConflict { .. }) => {}
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                committed
            })
        })
        .collect();

    let committed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(committed > 0);

    let a1 = value(&engine, "tblA", "recA1", "fldAmt").as_i64().unwrap();
    let a2 = value(&engine, "tblA", "recA2", "fldAmt").as_i64().unwrap();
    assert_eq!(value(&engine, "tblB", "recX", "fldSpent"), json!(a1 + a2));
    assert_eq!(value(&engine, "tblA", "recA1", "fldTotal"), json!(a1 * 2));
}
