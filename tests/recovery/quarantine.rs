//! Unreadable Record Tests
//!
//! A coordination record that fails its checksum quarantines its
//! collection; other collections keep working.

use std::fs;
use std::sync::Arc;

use crate::common::*;

/// Open "a" again over the documents it held before it shut down.
fn reopen(cluster: &TestCluster, store: Arc<ferry::DocumentStore>) -> ShardNode {
    ShardNode::open(cluster.options("a").with_store(store)).expect("reopen node")
}

fn corrupt_records(dir: &std::path::Path) -> usize {
    let mut n = 0;
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().map_or(false, |e| e == "rec") {
            fs::write(&path, b"definitely not a record").unwrap();
            n += 1;
        }
    }
    n
}

#[test]
fn corrupt_record_quarantines_collection() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    a.fail_points().enable(Checkpoint::AfterClone, FailAction::Interrupt);
    let handle = a.start_migration(&c, range(50, 100), b.id()).unwrap();
    assert!(handle.wait(WAIT).is_err());

    let store = Arc::clone(a.storage());
    drop(a);
    assert_eq!(corrupt_records(&cluster.node_dir("a").join("migrations")), 1);

    let a = reopen(&cluster, store);
    assert_eq!(a.startup_report().quarantined, vec![c]);
    assert!(!a.startup_report().is_clean());

    assert!(matches!(a.find(&c, &key(1)), Err(FerryError::Quarantined { .. })));
    assert!(matches!(a.insert(&c, doc(500)), Err(FerryError::Quarantined { .. })));
    assert!(matches!(a.cleanup_orphaned(&c), Err(FerryError::Quarantined { .. })));
    assert!(matches!(
        a.start_migration(&c, range(50, 100), b.id()),
        Err(FerryError::Quarantined { .. })
    ));

    // Nothing was deleted behind the quarantine
    assert_eq!(raw_count(&a, &c, 0, 100), 100);
}

#[test]
fn other_collections_keep_serving() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    let other = CollectionId::new();
    cluster.catalog.shard_collection(other, a.id().clone()).unwrap();
    seed(&a, &c, 0, 10);
    seed(&a, &other, 0, 10);
    a.fail_points().enable(Checkpoint::AfterClone, FailAction::Interrupt);
    assert!(a
        .start_migration(&c, range(0, 10), b.id())
        .unwrap()
        .wait(WAIT)
        .is_err());

    let store = Arc::clone(a.storage());
    drop(a);
    corrupt_records(&cluster.node_dir("a").join("migrations"));

    let a = reopen(&cluster, store);
    assert_eq!(a.find(&other, &key(3)).unwrap(), Some(doc(3)));
    a.insert(&other, doc(11)).unwrap();
    assert!(a.find(&c, &key(3)).is_err());
}

#[test]
fn unattributable_corrupt_record_refuses_open() {
    let cluster = TestCluster::new("a");
    drop(cluster.open("a"));

    let dir = cluster.node_dir("a").join("migrations");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("stray.rec"), b"garbage").unwrap();

    let result = ShardNode::open(cluster.options("a"));
    assert!(matches!(result, Err(FerryError::Corruption { .. })));
}
