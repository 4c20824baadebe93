//! Write Path Tests
//!
//! - Key-changing updates are one journaled unit
//! - A key change that would cross nodes is refused
//! - Writes to a moved range are refused on the donor

use crate::common::*;
use ferry::{KeyRange, WriteOp};
use serde_json::json;

#[test]
fn key_changing_update_is_one_journal_entry() {
    let cluster = TestCluster::new("a");
    let a = cluster.open("a");
    let c = cluster.collection;
    seed(&a, &c, 0, 5);

    let head = a.storage().journal_head(&c);
    a.update(&c, &key(3), Document::new(42, json!({ "moved": true })))
        .unwrap();

    assert!(a.find(&c, &key(3)).unwrap().is_none());
    assert_eq!(a.find(&c, &key(42)).unwrap().unwrap().body["moved"], json!(true));

    let entries = a.storage().entries_since(&c, head, &KeyRange::full()).unwrap();
    assert_eq!(entries.len(), 1);
    match &entries[0].op {
        WriteOp::ApplyOps(ops) => {
            assert_eq!(ops.len(), 2);
            assert_eq!(ops[0], WriteOp::Delete(key(3)));
            assert!(matches!(&ops[1], WriteOp::Insert(d) if d.key == key(42)));
        }
        other => panic!("expected ApplyOps, got {:?}", other),
    }
}

#[test]
fn key_change_onto_existing_key_is_rejected() {
    let cluster = TestCluster::new("a");
    let a = cluster.open("a");
    let c = cluster.collection;
    seed(&a, &c, 0, 5);

    let result = a.update(&c, &key(1), Document::new(2, json!({})));
    assert!(matches!(result, Err(FerryError::InvalidInput { .. })));
    assert_eq!(a.find(&c, &key(1)).unwrap(), Some(doc(1)));
    assert_eq!(a.find(&c, &key(2)).unwrap(), Some(doc(2)));
}

#[test]
fn key_change_across_nodes_is_refused() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    a.move_range(&c, range(50, 100), b.id(), WAIT).unwrap();

    let result = a.update(&c, &key(10), Document::new(60, json!({})));
    match result {
        Err(FerryError::KeyChangeAcrossNodes { from, to }) => {
            assert_eq!(from, key(10));
            assert_eq!(to, key(60));
        }
        other => panic!("expected KeyChangeAcrossNodes, got {:?}", other),
    }
    assert_eq!(a.find(&c, &key(10)).unwrap(), Some(doc(10)));
    assert_eq!(b.find(&c, &key(60)).unwrap(), Some(doc(60)));
}

#[test]
fn donor_refuses_writes_to_moved_range() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    a.move_range(&c, range(50, 100), b.id(), WAIT).unwrap();

    assert_eq!(b.remove(&c, &key(95)).unwrap(), Some(doc(95)));
    let result = a.insert(&c, doc(95));
    assert!(matches!(result, Err(FerryError::StaleOwnership { .. })));
    let result = a.update(&c, &key(60), doc(60));
    assert!(matches!(result, Err(FerryError::StaleOwnership { .. })));

    b.insert(&c, doc(95)).unwrap();
    assert_eq!(b.find(&c, &key(95)).unwrap(), Some(doc(95)));
    // Keys past the moved range still belong to the donor
    a.insert(&c, doc(150)).unwrap();
}

#[test]
fn update_and_remove_of_missing_key() {
    let cluster = TestCluster::new("a");
    let a = cluster.open("a");
    let c = cluster.collection;

    assert!(matches!(
        a.update(&c, &key(1), doc(1)),
        Err(FerryError::NotFound { .. })
    ));
    assert_eq!(a.remove(&c, &key(1)).unwrap(), None);

    a.insert(&c, doc(1)).unwrap();
    assert!(matches!(a.insert(&c, doc(1)), Err(FerryError::InvalidInput { .. })));
    assert_eq!(a.remove(&c, &key(1)).unwrap(), Some(doc(1)));
}
