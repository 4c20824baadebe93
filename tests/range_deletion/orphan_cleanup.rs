//! Orphan Cleanup Tests
//!
//! `cleanup_orphaned` purges one unowned gap per call and leaves pending
//! and queued ranges alone, no matter how often it is called.

use std::time::Duration;

use crate::common::*;
use ferry::{CleanWhen, Classification, EnsureOwnership, MetadataAuthority};

/// Hand `[min, max)` from "a" to "x" directly at the catalog.
fn give_away(cluster: &TestCluster, min: i64, max: i64) {
    let table = cluster.catalog.routing_table(&cluster.collection).unwrap();
    cluster
        .catalog
        .ensure_ownership_at_least(&EnsureOwnership {
            collection: cluster.collection,
            range: range(min, max),
            donor: NodeId::new("a"),
            recipient: NodeId::new("x"),
            version: table.version.next_major(),
        })
        .unwrap();
}

/// Node "a" owning everything except `[50, 100)` and `[200, 300)`, with
/// documents in all of `[0, 300)`.
fn two_gaps() -> (TestCluster, ShardNode) {
    let cluster = TestCluster::new("a");
    let a = cluster.open("a");
    seed(&a, &cluster.collection, 0, 300);
    give_away(&cluster, 50, 100);
    give_away(&cluster, 200, 300);
    (cluster, a)
}

#[test]
fn one_gap_is_purged_per_call() {
    let (cluster, a) = two_gaps();
    let c = cluster.collection;

    let first = a.cleanup_orphaned(&c).unwrap();
    assert_eq!(first.examined_ranges, 2);
    assert_eq!(first.skipped_ranges, 0);
    assert_eq!(first.docs_deleted, 50);
    assert_eq!(first.remaining_ranges, 1);
    assert_eq!(first.range_deleted, Some(range(50, 100)));

    let second = a.cleanup_orphaned(&c).unwrap();
    assert_eq!(second.docs_deleted, 100);
    assert_eq!(second.remaining_ranges, 0);
    assert_eq!(second.range_deleted, Some(range(200, 300)));

    let third = a.cleanup_orphaned(&c).unwrap();
    assert_eq!(third.range_deleted, None);
    assert_eq!(third.docs_deleted, 0);

    // Owned documents are untouched
    assert_eq!(raw_count(&a, &c, 0, 50), 50);
    assert_eq!(raw_count(&a, &c, 100, 200), 100);
    assert_eq!(raw_count(&a, &c, 50, 100), 0);
    assert_eq!(raw_count(&a, &c, 200, 300), 0);
}

#[test]
fn queued_range_is_skipped() {
    let (cluster, a) = two_gaps();
    let c = cluster.collection;
    a.parameters().set_disable_resumable_range_deleter(true);
    a.range_deleter()
        .schedule_range(c, range(200, 300), CleanWhen::Now)
        .unwrap();

    let response = a.cleanup_orphaned(&c).unwrap();
    assert_eq!(response.skipped_ranges, 1);
    assert_eq!(response.range_deleted, Some(range(50, 100)));

    let response = a.cleanup_orphaned(&c).unwrap();
    assert_eq!(response.range_deleted, None);
    assert_eq!(response.remaining_ranges, 0);
    assert_eq!(raw_count(&a, &c, 200, 300), 100);
}

#[test]
fn donor_pending_range_survives_repeated_cleanup() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    // Committed at the authority, follow-ups not yet run on the donor
    a.fail_points().enable(
        Checkpoint::AfterDecisionPersist,
        FailAction::Pause(Duration::from_millis(1_000)),
    );

    let handle = a.start_migration(&c, range(50, 100), b.id()).unwrap();
    assert!(wait_until(WAIT, || &cluster.owner_of(60) == b.id()));
    assert!(wait_until(WAIT, || a.find(&c, &key(60)).unwrap().is_none()));
    assert_eq!(a.classify(&c, &key(60)), Classification::PendingOutgoing);

    for _ in 0..20 {
        let response = a.cleanup_orphaned(&c).unwrap();
        assert_eq!(response.skipped_ranges, 1);
        assert_eq!(response.docs_deleted, 0);
        assert_eq!(response.range_deleted, None);
        assert_eq!(raw_count(&a, &c, 50, 100), 50);
    }
    assert_eq!(a.storage().get(&c, &key(60)), Some(doc(60)));

    assert_eq!(handle.wait(WAIT).unwrap(), MigrationDecision::Committed);
    assert_eq!(b.find(&c, &key(60)).unwrap(), Some(doc(60)));
}

#[test]
fn node_without_documents_has_nothing_to_clean() {
    let cluster = TestCluster::new("a");
    let a = cluster.open("a");
    let c = cluster.collection;

    let response = a.cleanup_orphaned(&c).unwrap();
    assert_eq!(response.examined_ranges, 0);
    assert_eq!(response.range_deleted, None);
    assert_eq!(response.remaining_ranges, 0);
}
