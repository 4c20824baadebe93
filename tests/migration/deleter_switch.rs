//! Range Deleter Switch Tests
//!
//! Migrations refuse to run when durable range deletion is switched off on
//! a node that would need it.

use std::time::Duration;

use crate::common::*;
use ferry::CleanWhen;

#[test]
fn donor_with_deleter_disabled_fails_fast() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    a.parameters().set_disable_resumable_range_deleter(true);

    let result = a.start_migration(&c, range(50, 100), b.id());
    match result {
        Err(FerryError::ResumableRangeDeleterDisabled { node }) => assert_eq!(&node, a.id()),
        other => panic!("expected ResumableRangeDeleterDisabled, got {:?}", other.map(|h| h.id())),
    }
    assert_eq!(&cluster.owner_of(60), a.id());
    assert!(a.range_deleter().queue().is_empty());
    assert_eq!(raw_count(&b, &c, 0, 100), 0);
}

#[test]
fn recipient_with_deleter_disabled_and_overlapping_task_aborts() {
    let cluster = TestCluster::new("a");
    let c = cluster.collection;
    let a = cluster.open("a");
    let b = cluster.open_with(
        "b",
        FerryConfig {
            orphan_cleanup_delay_ms: 60_000,
            ..fast_config()
        },
    );
    seed(&a, &c, 0, 100);
    b.range_deleter()
        .schedule_range(c, range(50, 100), CleanWhen::Delayed)
        .unwrap();
    b.parameters().set_disable_resumable_range_deleter(true);

    let handle = a.start_migration(&c, range(50, 100), b.id()).unwrap();
    match handle.wait(WAIT) {
        Err(FerryError::ResumableRangeDeleterDisabled { node }) => assert_eq!(&node, b.id()),
        other => panic!("expected ResumableRangeDeleterDisabled, got {:?}", other),
    }

    assert_eq!(&cluster.owner_of(60), a.id());
    assert_eq!(a.find(&c, &key(60)).unwrap(), Some(doc(60)));
    assert_eq!(raw_count(&a, &c, 0, 100), 100);
    assert!(wait_until(WAIT, || a.range_deleter().queue().is_empty()));
}

#[test]
fn recipient_with_deleter_disabled_and_no_overlap_still_receives() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    b.parameters().set_disable_resumable_range_deleter(true);

    let decision = a.move_range(&c, range(50, 100), b.id(), WAIT).unwrap();
    assert_eq!(decision, MigrationDecision::Committed);
    assert_eq!(b.find(&c, &key(75)).unwrap(), Some(doc(75)));
    assert!(b.range_deleter().queue().is_empty());
}

#[test]
fn donor_deleter_disabled_mid_migration_aborts() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    a.fail_points()
        .enable(Checkpoint::AfterClone, FailAction::Pause(Duration::from_millis(300)));

    let handle = a.start_migration(&c, range(50, 100), b.id()).unwrap();
    a.parameters().set_disable_resumable_range_deleter(true);

    match handle.wait(WAIT) {
        Err(FerryError::ResumableRangeDeleterDisabled { node }) => assert_eq!(&node, a.id()),
        other => panic!("expected ResumableRangeDeleterDisabled, got {:?}", other),
    }
    assert_eq!(&cluster.owner_of(60), a.id());
    assert_eq!(a.find(&c, &key(60)).unwrap(), Some(doc(60)));

    // The recipient's copy is orphaned and purged there
    assert!(wait_until(WAIT, || raw_count(&b, &c, 50, 100) == 0));
    assert!(wait_until(WAIT, || b.range_deleter().queue().is_empty()));
}
