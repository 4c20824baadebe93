//! Critical Section Tests
//!
//! - A recipient that never acknowledges in time aborts the migration
//! - Writes blocked by the critical section are never lost

use std::time::Duration;

use crate::common::*;
use ferry::MigrationPhase;
use serde_json::json;

#[test]
fn slow_recipient_times_out_and_aborts() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    // Longer than critical_section_timeout_ms on every attempt
    b.fail_points().enable(
        Checkpoint::RecipientCommitStart,
        FailAction::Pause(Duration::from_millis(700)),
    );

    let handle = a.start_migration(&c, range(50, 100), b.id()).unwrap();
    let result = handle.wait(WAIT);
    assert!(matches!(result, Err(FerryError::Timeout { .. })), "{:?}", result);

    let status = handle.status();
    assert_eq!(status.critical_section_attempts, a.config().critical_section_max_attempts);
    assert_eq!(status.decision, Some(MigrationDecision::Aborted));
    assert_eq!(&cluster.owner_of(60), a.id());

    // Writes resume on the donor once the section is released
    a.update(&c, &key(55), Document::new(55, json!({ "after": "abort" })))
        .unwrap();
    assert!(wait_until(WAIT, || raw_count(&b, &c, 50, 100) == 0));
}

#[test]
fn write_during_critical_section_is_applied_exactly_once() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    b.fail_points().enable(
        Checkpoint::RecipientCommitStart,
        FailAction::Pause(Duration::from_millis(200)),
    );

    let handle = a.start_migration(&c, range(50, 100), b.id()).unwrap();
    assert!(wait_until(WAIT, || {
        handle.status().phase == MigrationPhase::CriticalSection
    }));

    let write = Document::new(60, json!({ "during": "critical section" }));
    let result = a.update(&c, &key(60), write.clone());
    assert_eq!(handle.wait(WAIT).unwrap(), MigrationDecision::Committed);

    let on_recipient = b.find(&c, &key(60)).unwrap().unwrap();
    match result {
        Ok(_) => assert_eq!(on_recipient, write),
        Err(FerryError::StaleOwnership { .. }) => assert_eq!(on_recipient, doc(60)),
        Err(e) => panic!("unexpected write error: {}", e),
    }
}

#[test]
fn canceled_migration_keeps_state_until_recovery() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    a.fail_points()
        .enable(Checkpoint::AfterClone, FailAction::Pause(Duration::from_millis(300)));

    let handle = a.start_migration(&c, range(50, 100), b.id()).unwrap();
    handle.cancel();
    let result = handle.wait(WAIT);
    assert!(matches!(result, Err(FerryError::Interrupted { .. })), "{:?}", result);

    // Persisted state is left for recovery
    assert_eq!(a.range_deleter().queue().len(), 1);
    assert_eq!(&cluster.owner_of(60), a.id());

    let report = a.recover();
    assert_eq!(report.resumed, 1);
    assert_eq!(report.aborted, 1);
    assert!(report.is_clean());
    assert!(a.range_deleter().queue().is_empty());
    assert_eq!(a.find(&c, &key(60)).unwrap(), Some(doc(60)));
    assert!(wait_until(WAIT, || raw_count(&b, &c, 50, 100) == 0));
}
