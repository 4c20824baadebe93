//! Partitioned Recipient Tests
//!
//! - A recipient cut off after the decision is persisted gets the committed
//!   range once it is reachable again, without a recovery pass
//! - An abort frees the donor's range even while the recipient is away

use std::time::Duration;

use crate::common::*;
use ferry::Classification;

#[test]
fn committed_follow_ups_finish_after_heal() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    a.fail_points().enable(
        Checkpoint::AfterDecisionPersist,
        FailAction::Pause(Duration::from_millis(300)),
    );

    let handle = a.start_migration(&c, range(50, 100), b.id()).unwrap();
    assert!(wait_until(WAIT, || &cluster.owner_of(60) == b.id()));
    cluster.directory.partition(b.id());

    // The decision is durable, so the caller learns it right away
    assert_eq!(handle.wait(WAIT).unwrap(), MigrationDecision::Committed);
    assert!(a.find(&c, &key(60)).unwrap().is_none());
    assert_eq!(b.classify(&c, &key(60)), Classification::PendingIncoming);
    assert!(b.find(&c, &key(60)).unwrap().is_none());
    assert_eq!(raw_count(&a, &c, 50, 100), 50);
    assert_eq!(a.range_deleter().queue().len(), 1);

    cluster.directory.heal(b.id());
    assert!(wait_until(WAIT, || b.find(&c, &key(60)).unwrap().is_some()));
    assert_eq!(b.scan(&c, &range(50, 100)).unwrap().len(), 50);
    assert!(wait_until(WAIT, || raw_count(&a, &c, 50, 100) == 0));
    assert!(wait_until(WAIT, || a.range_deleter().queue().is_empty()));
    assert!(wait_until(WAIT, || a.recover().resumed == 0));
}

#[test]
fn abort_frees_donor_range_while_recipient_is_away() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    a.fail_points().enable(
        Checkpoint::BeforeCriticalSection,
        FailAction::Pause(Duration::from_millis(300)),
    );

    let handle = a.start_migration(&c, range(50, 100), b.id()).unwrap();
    assert!(wait_until(WAIT, || raw_count(&b, &c, 50, 100) == 50));
    cluster.directory.partition(b.id());

    let result = handle.wait(WAIT);
    assert!(matches!(result, Err(FerryError::NodeUnreachable { .. })), "{:?}", result);
    assert_eq!(handle.status().decision, Some(MigrationDecision::Aborted));

    // Donor side is settled without the recipient
    assert_eq!(a.classify(&c, &key(60)), Classification::Owned);
    assert!(a.range_deleter().queue().is_empty());
    a.update(&c, &key(60), doc(60)).unwrap();

    // Recipient keeps its clone until it hears about the abort
    assert_eq!(raw_count(&b, &c, 50, 100), 50);
    cluster.directory.heal(b.id());
    assert!(wait_until(WAIT, || raw_count(&b, &c, 50, 100) == 0));
    assert!(wait_until(WAIT, || b.range_deleter().queue().is_empty()));
    assert!(wait_until(WAIT, || a.recover().resumed == 0));

    a.fail_points().disable(Checkpoint::BeforeCriticalSection);
    assert_eq!(
        a.move_range(&c, range(50, 100), b.id(), WAIT).unwrap(),
        MigrationDecision::Committed
    );
}
