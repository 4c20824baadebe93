//! Range Deletion Processor Tests
//!
//! - Queued ranges are purged, oldest first
//! - Delayed tasks wait out the safe-time delay
//! - Tasks survive a restart
//! - Owned documents are never deleted
//! - Removing a task stops its deletion

use std::time::{Duration, Instant};

use crate::common::*;
use ferry::{CleanWhen, Classification};

/// Node "a" holding raw documents `[min, max)` of a collection owned by "x".
fn orphan_holder(config: FerryConfig, min: i64, max: i64) -> (TestCluster, ShardNode) {
    let cluster = TestCluster::new("x");
    let a = cluster.open_with("a", config);
    for k in min..max {
        a.storage().put(&cluster.collection, doc(k));
    }
    (cluster, a)
}

// ============================================================================
// Processing
// ============================================================================

#[test]
fn queued_ranges_are_purged() {
    let (cluster, a) = orphan_holder(fast_config(), 0, 30);
    let c = cluster.collection;
    a.refresh_ownership(&c).unwrap();
    assert_eq!(a.classify(&c, &key(5)), Classification::Orphaned);

    for (min, max) in [(0, 10), (10, 20), (20, 30)] {
        a.range_deleter()
            .schedule_range(c, range(min, max), CleanWhen::Now)
            .unwrap();
    }
    a.range_deleter()
        .wait_for_clean(&c, &range(0, 30), WAIT)
        .unwrap();

    assert_eq!(raw_count(&a, &c, 0, 30), 0);
    assert!(a.range_deleter().queue().is_empty());
    let total: u64 = a
        .range_deleter()
        .all_progress()
        .iter()
        .map(|p| p.docs_deleted)
        .sum();
    assert_eq!(total, 30);
}

#[test]
fn delayed_task_waits_for_safe_time() {
    let config = FerryConfig {
        orphan_cleanup_delay_ms: 300,
        ..fast_config()
    };
    let (cluster, a) = orphan_holder(config, 0, 10);
    let c = cluster.collection;

    let started = Instant::now();
    a.range_deleter()
        .schedule_range(c, range(0, 10), CleanWhen::Delayed)
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(raw_count(&a, &c, 0, 10), 10);

    a.range_deleter()
        .wait_for_clean(&c, &range(0, 10), WAIT)
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(raw_count(&a, &c, 0, 10), 0);
}

#[test]
fn committed_range_stays_on_donor_until_safe_time() {
    let cluster = TestCluster::new("a");
    let delay = Duration::from_millis(1_500);
    let config = FerryConfig {
        orphan_cleanup_delay_ms: delay.as_millis() as u64,
        ..fast_config()
    };
    let a = cluster.open_with("a", config);
    let b = cluster.open("b");
    let c = cluster.collection;
    seed(&a, &c, 0, 100);

    let started = Instant::now();
    assert_eq!(
        a.move_range(&c, range(50, 100), b.id(), WAIT).unwrap(),
        MigrationDecision::Committed
    );
    assert_eq!(b.find(&c, &key(60)).unwrap(), Some(doc(60)));
    assert!(a.find(&c, &key(60)).unwrap().is_none());
    assert_eq!(a.storage().get(&c, &key(60)), Some(doc(60)));

    // The queued donor task blocks manual cleanup too
    for _ in 0..20 {
        assert_eq!(a.cleanup_orphaned(&c).unwrap().docs_deleted, 0);
    }
    if started.elapsed() < delay {
        assert_eq!(a.storage().get(&c, &key(60)), Some(doc(60)));
    }

    a.range_deleter()
        .wait_for_clean(&c, &range(50, 100), WAIT)
        .unwrap();
    assert!(started.elapsed() >= delay);
    assert_eq!(a.storage().get(&c, &key(60)), None);
    assert_eq!(raw_count(&a, &c, 50, 100), 0);
    assert_eq!(raw_count(&a, &c, 0, 50), 50);
    assert!(wait_until(WAIT, || a.recover().resumed == 0));
}

#[test]
fn owned_documents_are_never_deleted() {
    let cluster = TestCluster::new("a");
    let a = cluster.open("a");
    let c = cluster.collection;
    seed(&a, &c, 0, 10);

    a.range_deleter()
        .schedule_range(c, range(0, 10), CleanWhen::Now)
        .unwrap();
    a.range_deleter()
        .wait_for_clean(&c, &range(0, 10), WAIT)
        .unwrap();

    assert_eq!(raw_count(&a, &c, 0, 10), 10);
    assert_eq!(a.scan(&c, &range(0, 10)).unwrap().len(), 10);
}

#[test]
fn only_the_task_range_is_purged() {
    let (cluster, a) = orphan_holder(fast_config(), 0, 30);
    let c = cluster.collection;

    a.range_deleter()
        .schedule_range(c, range(10, 20), CleanWhen::Now)
        .unwrap();
    a.range_deleter()
        .wait_for_clean(&c, &range(10, 20), WAIT)
        .unwrap();

    assert_eq!(raw_count(&a, &c, 0, 10), 10);
    assert_eq!(raw_count(&a, &c, 10, 20), 0);
    assert_eq!(raw_count(&a, &c, 20, 30), 10);
}

// ============================================================================
// Durability
// ============================================================================

#[test]
fn tasks_resume_after_restart() {
    let (cluster, a) = orphan_holder(fast_config(), 0, 20);
    let c = cluster.collection;
    a.parameters().set_disable_resumable_range_deleter(true);
    a.range_deleter()
        .schedule_range(c, range(0, 20), CleanWhen::Now)
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(raw_count(&a, &c, 0, 20), 20);
    assert_eq!(a.range_deleter().queue().len(), 1);

    // The switch is a live parameter; the restarted node starts enabled.
    let a = a.restart().unwrap();
    a.range_deleter()
        .wait_for_clean(&c, &range(0, 20), WAIT)
        .unwrap();
    assert_eq!(raw_count(&a, &c, 0, 20), 0);
}

#[test]
fn wait_for_clean_times_out_while_disabled() {
    let (cluster, a) = orphan_holder(fast_config(), 0, 10);
    let c = cluster.collection;
    a.parameters().set_disable_resumable_range_deleter(true);
    a.range_deleter()
        .schedule_range(c, range(0, 10), CleanWhen::Now)
        .unwrap();

    let result = a
        .range_deleter()
        .wait_for_clean(&c, &range(5, 15), Duration::from_millis(100));
    assert!(matches!(result, Err(FerryError::Timeout { .. })));

    // Non-overlapping ranges are clean already
    a.range_deleter()
        .wait_for_clean(&c, &range(10, 20), Duration::from_millis(100))
        .unwrap();

    a.parameters().set_disable_resumable_range_deleter(false);
    a.range_deleter()
        .wait_for_clean(&c, &range(5, 15), WAIT)
        .unwrap();
    assert_eq!(raw_count(&a, &c, 0, 10), 0);
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn removing_a_task_stops_its_deletion() {
    let config = FerryConfig {
        range_deleter_batch_size: 4,
        range_deleter_batch_delay_ms: 50,
        ..fast_config()
    };
    let (cluster, a) = orphan_holder(config, 0, 200);
    let c = cluster.collection;

    let task_id = a
        .range_deleter()
        .schedule_range(c, range(0, 200), CleanWhen::Now)
        .unwrap();
    assert!(wait_until(WAIT, || {
        a.range_deleter()
            .progress(&task_id)
            .map_or(false, |p| p.docs_deleted > 0)
    }));
    assert!(a.range_deleter().queue().remove(&task_id).unwrap());

    assert!(wait_until(WAIT, || {
        a.range_deleter()
            .progress(&task_id)
            .map_or(false, |p| p.canceled)
    }));
    let left = raw_count(&a, &c, 0, 200);
    assert!(left > 0, "canceled task deleted everything");
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(raw_count(&a, &c, 0, 200), left);
}
