//! Step Boundary Tests
//!
//! Each checkpoint is armed to interrupt the coordinator. Recovery must then
//! settle the migration: committed if the fenced commit landed, aborted
//! otherwise, with every range deletion task and record cleaned up.

use crate::common::*;
use ferry::Classification;

fn interrupt_at(checkpoint: Checkpoint) -> (TestCluster, ShardNode, ShardNode) {
    let (cluster, a, b) = TestCluster::pair();
    seed(&a, &cluster.collection, 0, 100);
    a.fail_points().enable(checkpoint, FailAction::Interrupt);

    let handle = a
        .start_migration(&cluster.collection, range(50, 100), b.id())
        .unwrap();
    let result = handle.wait(WAIT);
    assert!(
        matches!(result, Err(FerryError::Interrupted { .. })),
        "{:?}: {:?}",
        checkpoint,
        result
    );
    (cluster, a, b)
}

fn assert_committed(cluster: &TestCluster, a: &ShardNode, b: &ShardNode) {
    let c = cluster.collection;
    assert_eq!(&cluster.owner_of(60), b.id());
    assert!(a.find(&c, &key(60)).unwrap().is_none());
    assert_eq!(b.find(&c, &key(60)).unwrap(), Some(doc(60)));
    assert_eq!(b.classify(&c, &key(60)), Classification::Owned);
    assert_eq!(b.scan(&c, &range(50, 100)).unwrap().len(), 50);
    assert!(wait_until(WAIT, || raw_count(a, &c, 50, 100) == 0));
    assert_eq!(raw_count(a, &c, 0, 50), 50);
    assert!(wait_until(WAIT, || a.range_deleter().queue().is_empty()));
    assert!(b.range_deleter().queue().is_empty());
    assert!(wait_until(WAIT, || a.recover().resumed == 0));
}

fn assert_aborted(cluster: &TestCluster, a: &ShardNode, b: &ShardNode) {
    let c = cluster.collection;
    assert_eq!(&cluster.owner_of(60), a.id());
    assert_eq!(a.find(&c, &key(60)).unwrap(), Some(doc(60)));
    assert_eq!(a.classify(&c, &key(60)), Classification::Owned);
    assert_eq!(raw_count(a, &c, 0, 100), 100);
    assert!(b.find(&c, &key(60)).unwrap().is_none());
    assert!(wait_until(WAIT, || raw_count(b, &c, 50, 100) == 0));
    assert!(wait_until(WAIT, || b.range_deleter().queue().is_empty()));
    assert!(a.range_deleter().queue().is_empty());
    assert!(wait_until(WAIT, || a.recover().resumed == 0));
}

const AFTER_COMMIT: [Checkpoint; 5] = [
    Checkpoint::AfterFencingCommit,
    Checkpoint::AfterAuthorityRefresh,
    Checkpoint::AfterDecisionPersist,
    Checkpoint::AfterRecipientTaskRemoval,
    Checkpoint::AfterLocalTaskReady,
];

const BEFORE_COMMIT: [Checkpoint; 2] = [Checkpoint::AfterClone, Checkpoint::BeforeCriticalSection];

// ============================================================================
// On-demand recovery
// ============================================================================

#[test]
fn recover_commits_after_fenced_commit() {
    for checkpoint in AFTER_COMMIT {
        let (cluster, a, b) = interrupt_at(checkpoint);
        a.fail_points().disable(checkpoint);

        let report = a.recover();
        assert_eq!(report.resumed, 1, "{:?}", checkpoint);
        assert_eq!(report.committed, 1, "{:?}", checkpoint);
        assert!(report.failed.is_empty(), "{:?}: {:?}", checkpoint, report.failed);
        assert_committed(&cluster, &a, &b);
    }
}

#[test]
fn recover_aborts_before_fenced_commit() {
    for checkpoint in BEFORE_COMMIT {
        let (cluster, a, b) = interrupt_at(checkpoint);
        a.fail_points().disable(checkpoint);

        let report = a.recover();
        assert_eq!(report.aborted, 1, "{:?}", checkpoint);
        assert_eq!(report.forgotten, 1, "{:?}", checkpoint);
        assert_aborted(&cluster, &a, &b);
    }
}

// ============================================================================
// Restart
// ============================================================================

#[test]
fn restart_commits_after_fenced_commit() {
    for checkpoint in AFTER_COMMIT {
        let (cluster, a, b) = interrupt_at(checkpoint);

        let a = a.restart().unwrap();
        let report = a.startup_report();
        assert_eq!(report.committed, 1, "{:?}", checkpoint);
        assert!(report.is_clean(), "{:?}: {:?}", checkpoint, report);
        assert_committed(&cluster, &a, &b);
    }
}

#[test]
fn restart_aborts_before_fenced_commit() {
    for checkpoint in BEFORE_COMMIT {
        let (cluster, a, b) = interrupt_at(checkpoint);

        let a = a.restart().unwrap();
        assert_eq!(a.startup_report().aborted, 1, "{:?}", checkpoint);
        assert_aborted(&cluster, &a, &b);
    }
}

#[test]
fn recipient_restart_keeps_range_pending_until_decision() {
    let (cluster, a, b) = interrupt_at(Checkpoint::AfterFencingCommit);
    let c = cluster.collection;
    assert_eq!(&cluster.owner_of(60), b.id());

    let b = b.restart().unwrap();
    assert_eq!(b.startup_report().incoming_restored, 1);
    assert_eq!(b.classify(&c, &key(60)), Classification::PendingIncoming);
    assert!(b.find(&c, &key(60)).unwrap().is_none());
    assert_eq!(raw_count(&b, &c, 50, 100), 50);

    a.fail_points().disable(Checkpoint::AfterFencingCommit);
    assert_eq!(a.recover().committed, 1);
    assert_committed(&cluster, &a, &b);
}

#[test]
fn step_up_runs_recovery() {
    let (cluster, a, b) = interrupt_at(Checkpoint::AfterDecisionPersist);
    a.fail_points().disable(Checkpoint::AfterDecisionPersist);

    let report = a.step_up();
    assert_eq!(report.committed, 1);
    assert_committed(&cluster, &a, &b);
}
