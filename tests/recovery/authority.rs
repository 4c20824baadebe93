//! Metadata Authority Fault Tests
//!
//! - A commit whose response was lost is retried and found applied
//! - An unreachable authority delays the commit but never turns it into
//!   an abort
//! - Canceling while the authority is away leaves the decision to recovery

use crate::common::*;
use ferry::{Classification, MigrationPhase};

#[test]
fn lost_commit_response_is_idempotent() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    cluster.catalog.inject_lost_responses(1);

    let before = cluster.catalog.commit_calls();
    let decision = a.move_range(&c, range(50, 100), b.id(), WAIT).unwrap();
    assert_eq!(decision, MigrationDecision::Committed);
    assert_eq!(cluster.catalog.commit_calls() - before, 2);

    assert_eq!(&cluster.owner_of(60), b.id());
    assert_eq!(b.find(&c, &key(60)).unwrap(), Some(doc(60)));
    assert!(wait_until(WAIT, || raw_count(&a, &c, 50, 100) == 0));
}

#[test]
fn failures_beyond_one_retry_round_still_commit() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    // One more than fast_config's retry round of four calls
    cluster.catalog.inject_failures(5);

    let before = cluster.catalog.commit_calls();
    let decision = a.move_range(&c, range(50, 100), b.id(), WAIT).unwrap();
    assert_eq!(decision, MigrationDecision::Committed);
    assert_eq!(cluster.catalog.commit_calls() - before, 6);
    assert_eq!(&cluster.owner_of(60), b.id());
    assert_eq!(b.find(&c, &key(60)).unwrap(), Some(doc(60)));
    assert!(wait_until(WAIT, || raw_count(&a, &c, 50, 100) == 0));
}

#[test]
fn authority_outage_holds_commit_until_it_answers() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    cluster.catalog.inject_failures(usize::MAX);

    let handle = a.start_migration(&c, range(50, 100), b.id()).unwrap();
    assert!(wait_until(WAIT, || cluster.catalog.commit_calls() >= 12));
    let status = handle.status();
    assert!(!status.finished);
    assert_eq!(status.phase, MigrationPhase::Committing);
    assert_eq!(status.decision, None);
    assert_eq!(&cluster.owner_of(60), a.id());

    cluster.catalog.inject_failures(0);
    assert_eq!(handle.wait(WAIT).unwrap(), MigrationDecision::Committed);
    assert_eq!(&cluster.owner_of(60), b.id());
    assert_eq!(b.find(&c, &key(60)).unwrap(), Some(doc(60)));
    assert!(wait_until(WAIT, || raw_count(&a, &c, 50, 100) == 0));
    assert!(wait_until(WAIT, || a.range_deleter().queue().is_empty()));
}

#[test]
fn cancel_during_outage_leaves_decision_to_recovery() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    cluster.catalog.inject_failures(usize::MAX);

    let handle = a.start_migration(&c, range(50, 100), b.id()).unwrap();
    assert!(wait_until(WAIT, || cluster.catalog.commit_calls() >= 4));
    handle.cancel();
    let result = handle.wait(WAIT);
    assert!(matches!(result, Err(FerryError::Interrupted { .. })), "{:?}", result);
    assert_eq!(handle.status().decision, None);
    assert_eq!(a.range_deleter().queue().len(), 1);

    // The commit never landed, so recovery decides abort
    cluster.catalog.inject_failures(0);
    let report = a.recover();
    assert_eq!(report.resumed, 1);
    assert_eq!(report.aborted, 1);
    assert_eq!(&cluster.owner_of(60), a.id());
    assert_eq!(a.classify(&c, &key(60)), Classification::Owned);
    a.update(&c, &key(60), doc(60)).unwrap();
    assert!(wait_until(WAIT, || raw_count(&b, &c, 50, 100) == 0));
    assert!(a.range_deleter().queue().is_empty());
}

#[test]
fn commit_behind_many_lost_responses_is_found_applied() {
    let (cluster, a, b) = TestCluster::pair();
    let c = cluster.collection;
    seed(&a, &c, 0, 100);
    // Every attempt applies but reports failure, across several rounds
    cluster.catalog.inject_lost_responses(10);

    let result = a.move_range(&c, range(50, 100), b.id(), WAIT);
    cluster.catalog.inject_lost_responses(0);
    assert_eq!(result.unwrap(), MigrationDecision::Committed);
    assert_eq!(&cluster.owner_of(60), b.id());
    assert_eq!(b.find(&c, &key(60)).unwrap(), Some(doc(60)));
}
