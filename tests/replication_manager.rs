//! Replication Manager Tests
//!
//! Drives the public `BackupManager` API against a simulated cluster:
//! - open / sync / free lifecycle of a single segment
//! - membership changes while replication is in flight
//! - repeated backup failures
//! - free before sync, legacy free by id, teardown

use bytes::Bytes;
use segrep::observability::RpcKind;
use segrep::replication::{
    BackupManager, ReplicaPhase, ReplicationConfig, ReplicationErrorKind, SegmentPhase, ServerId,
};
use segrep::sim::SimulatedCluster;

const MASTER: ServerId = ServerId(1000);
const FOURTEEN: &[u8] = b"fourteen bytes";

fn manager(cluster: &SimulatedCluster, replicas: u32) -> BackupManager {
    manager_with(cluster, ReplicationConfig::with_replicas(replicas))
}

fn manager_with(cluster: &SimulatedCluster, config: ReplicationConfig) -> BackupManager {
    BackupManager::new(
        Some(cluster.membership()),
        cluster.transport(),
        MASTER,
        config,
    )
    .unwrap()
}

/// Run passes until `done` holds. Returns false if it never did.
fn proceed_until(
    mgr: &mut BackupManager,
    max_passes: usize,
    done: impl Fn(&BackupManager) -> bool,
) -> bool {
    for _ in 0..max_passes {
        if done(mgr) {
            return true;
        }
        mgr.proceed();
    }
    done(mgr)
}

fn free_requests(cluster: &SimulatedCluster) -> usize {
    cluster
        .requests()
        .iter()
        .filter(|r| r.kind == RpcKind::Free)
        .count()
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Three replicas of a 14-byte segment: open, sync, free, reclaim.
#[test]
fn test_open_sync_free_fourteen_bytes() {
    let cluster = SimulatedCluster::with_backups(3);
    let mut mgr = manager(&cluster, 3);

    let h = mgr.open_segment(5, Bytes::from_static(FOURTEEN)).unwrap();
    assert!(!mgr.is_synced(h));

    mgr.proceed();
    assert_eq!(
        mgr.replica_phases(h).unwrap(),
        vec![ReplicaPhase::OpenPending; 3]
    );
    assert_eq!(mgr.outstanding_rpcs(), 3);

    mgr.proceed();
    assert!(mgr.is_synced(h));
    assert_eq!(mgr.replica_acked_bytes(h).unwrap(), vec![14, 14, 14]);
    assert_eq!(mgr.segment_phase(h).unwrap(), SegmentPhase::Synced);
    assert!(!mgr.is_scheduled(h));

    mgr.free(h).unwrap();
    assert!(proceed_until(&mut mgr, 10, |m| !m.contains(h)));
    assert_eq!(free_requests(&cluster), 3);
    assert!(mgr.tracked_segments().is_empty());
    assert!(!mgr.is_scheduled(h));
    for backup in 1..=3 {
        assert_eq!(cluster.replica(ServerId(backup), MASTER, 5), None);
    }
}

/// Replicas land on distinct backups and hold identical bytes.
#[test]
fn test_replicas_are_distinct_and_identical() {
    let cluster = SimulatedCluster::with_backups(5);
    let mut mgr = manager(&cluster, 3);
    let h = mgr.open_segment(1, Bytes::from_static(FOURTEEN)).unwrap();
    mgr.sync();

    let mut backups: Vec<ServerId> = mgr.replica_backups(h).unwrap().into_iter().flatten().collect();
    assert_eq!(backups.len(), 3);
    backups.sort();
    backups.dedup();
    assert_eq!(backups.len(), 3);

    let expected = crc32fast::hash(FOURTEEN);
    for backup in backups {
        assert_eq!(cluster.replica_checksum(backup, MASTER, 1), Some(expected));
    }
}

/// Opening returns immediately; the data path never waits on backups.
#[test]
fn test_open_and_proceed_do_not_wait_for_backups() {
    let cluster = SimulatedCluster::with_backups(3);
    cluster.pause();
    let mut mgr = manager(&cluster, 3);

    let h = mgr.open_segment(1, Bytes::from_static(FOURTEEN)).unwrap();
    for _ in 0..5 {
        mgr.proceed();
    }
    assert!(!mgr.is_synced(h));
    assert_eq!(mgr.outstanding_rpcs(), 3);

    cluster.resume();
    mgr.sync();
    assert!(mgr.is_synced(h));
}

/// Idle `proceed` issues nothing and changes nothing.
#[test]
fn test_idle_proceed_is_noop() {
    let cluster = SimulatedCluster::with_backups(3);
    let mut mgr = manager(&cluster, 3);
    let h = mgr.open_segment(1, Bytes::from_static(FOURTEEN)).unwrap();
    mgr.sync();

    let requests = cluster.requests();
    let phases = mgr.replica_phases(h).unwrap();
    for _ in 0..10 {
        assert_eq!(mgr.proceed(), 0);
    }
    assert_eq!(cluster.requests(), requests);
    assert_eq!(mgr.replica_phases(h).unwrap(), phases);
    assert!(mgr.is_idle());
}

/// Tracked count equals opens minus reclaimed frees, in open order.
#[test]
fn test_tracked_segments_follow_open_order() {
    let cluster = SimulatedCluster::with_backups(3);
    let mut mgr = manager(&cluster, 2);

    let handles: Vec<_> = (1..=10)
        .map(|id| mgr.open_segment(id, Bytes::from_static(FOURTEEN)).unwrap())
        .collect();
    assert_eq!(mgr.tracked_segments().len(), 10);

    for idx in [1, 4, 7] {
        mgr.free(handles[idx]).unwrap();
    }
    mgr.sync();
    assert!(proceed_until(&mut mgr, 20, |m| m.is_idle()));

    assert_eq!(mgr.tracked_segments(), vec![1, 3, 4, 6, 7, 9, 10]);
}

// =============================================================================
// Membership changes and failures
// =============================================================================

/// A backup vanishes mid-replication; one change notification suffices.
#[test]
fn test_membership_shrink_rereplicates() {
    let cluster = SimulatedCluster::with_backups(3);
    cluster.set_latency(2);
    let mut mgr = manager(&cluster, 3);
    let h = mgr.open_segment(5, Bytes::from_static(FOURTEEN)).unwrap();

    mgr.proceed();
    assert_eq!(
        mgr.replica_backups(h).unwrap(),
        vec![Some(ServerId(1)), Some(ServerId(2)), Some(ServerId(3))]
    );

    cluster.kill(ServerId(2));
    cluster.add_backup(ServerId(4));
    mgr.cluster_configuration_changed();

    assert!(proceed_until(&mut mgr, 50, |m| m.is_synced(h)));
    let backups = mgr.replica_backups(h).unwrap();
    assert!(!backups.contains(&Some(ServerId(2))));
    assert!(backups.contains(&Some(ServerId(4))));
    assert_eq!(mgr.replica_acked_bytes(h).unwrap(), vec![14, 14, 14]);
    assert_eq!(
        cluster.replica(ServerId(4), MASTER, 5).unwrap(),
        FOURTEEN.to_vec()
    );
}

/// A synced replica whose backup leaves is re-created after the change.
#[test]
fn test_synced_segment_recovers_from_lost_backup() {
    let cluster = SimulatedCluster::with_backups(4);
    let mut mgr = manager(&cluster, 3);
    let h = mgr.open_segment(1, Bytes::from_static(FOURTEEN)).unwrap();
    mgr.sync();
    assert!(!mgr.replica_backups(h).unwrap().contains(&Some(ServerId(4))));

    cluster.kill(ServerId(1));
    mgr.cluster_configuration_changed();
    assert!(!mgr.is_synced(h));
    assert!(mgr.is_scheduled(h));

    mgr.sync();
    assert!(mgr.is_synced(h));
    assert!(mgr.replica_backups(h).unwrap().contains(&Some(ServerId(4))));
    assert_eq!(mgr.metrics().replicas_lost, 1);
}

/// `sync` notices a dead backup even without a change notification.
#[test]
fn test_sync_rearms_silently_degraded_segment() {
    let cluster = SimulatedCluster::with_backups(3);
    let mut mgr = manager(&cluster, 2);
    let h = mgr.open_segment(1, Bytes::from_static(FOURTEEN)).unwrap();
    mgr.sync();

    cluster.kill(ServerId(1));
    mgr.sync();
    let backups = mgr.replica_backups(h).unwrap();
    assert!(!backups.contains(&Some(ServerId(1))));
    assert!(mgr.is_synced(h));
}

/// Re-arming unaffected segments issues nothing.
#[test]
fn test_cluster_change_without_loss_is_quiet() {
    let cluster = SimulatedCluster::with_backups(3);
    let mut mgr = manager(&cluster, 3);
    let h = mgr.open_segment(1, Bytes::from_static(FOURTEEN)).unwrap();
    mgr.sync();
    let requests = cluster.requests().len();

    cluster.add_backup(ServerId(9));
    mgr.cluster_configuration_changed();
    assert!(mgr.is_scheduled(h));
    mgr.proceed();

    assert!(!mgr.is_scheduled(h));
    assert_eq!(cluster.requests().len(), requests);
}

/// Failing on two backups before succeeding on a third.
#[test]
fn test_repeated_failures_then_success() {
    let cluster = SimulatedCluster::with_backups(3);
    cluster.fail_next(ServerId(1), 100);
    cluster.fail_next(ServerId(2), 100);
    let mut mgr = manager(&cluster, 1);

    let h = mgr.open_segment(1, Bytes::from_static(FOURTEEN)).unwrap();
    mgr.sync();

    assert!(mgr.is_synced(h));
    assert_eq!(mgr.replica_backups(h).unwrap(), vec![Some(ServerId(3))]);
    assert_eq!(mgr.replica_acked_bytes(h).unwrap(), vec![14]);
    assert_eq!(mgr.metrics().rpc_failures, 2);
}

/// Persistent failures on some backups never block the healthy ones.
#[test]
fn test_persistent_failures_do_not_stall_sync() {
    let cluster = SimulatedCluster::with_backups(5);
    cluster.fail_next(ServerId(1), u32::MAX);
    cluster.fail_next(ServerId(2), u32::MAX);
    let mut mgr = manager(&cluster, 3);

    let handles: Vec<_> = (1..=4)
        .map(|id| mgr.open_segment(id, Bytes::from_static(FOURTEEN)).unwrap())
        .collect();
    mgr.sync();

    for h in handles {
        assert!(mgr.is_synced(h));
        for backup in mgr.replica_backups(h).unwrap().into_iter().flatten() {
            assert!(backup.get() >= 3);
        }
    }
}

/// Without enough backups the segment waits; more backups unblock it.
#[test]
fn test_waits_for_backups_to_appear() {
    let cluster = SimulatedCluster::with_backups(1);
    let mut mgr = manager(&cluster, 2);
    let h = mgr.open_segment(1, Bytes::from_static(FOURTEEN)).unwrap();

    assert!(!proceed_until(&mut mgr, 20, |m| m.is_synced(h)));
    assert_eq!(
        mgr.replica_phases(h).unwrap()[1],
        ReplicaPhase::Unassigned
    );
    assert!(mgr.is_scheduled(h));

    cluster.add_backup(ServerId(2));
    mgr.cluster_configuration_changed();
    mgr.sync();
    assert!(mgr.is_synced(h));
}

// =============================================================================
// Free paths
// =============================================================================

/// Freeing with unassigned slots is legal and reclaims the segment.
#[test]
fn test_free_before_sync() {
    let cluster = SimulatedCluster::with_backups(1);
    let mut mgr = manager(&cluster, 3);
    let h = mgr.open_segment(1, Bytes::from_static(FOURTEEN)).unwrap();
    mgr.proceed();

    mgr.free(h).unwrap();
    assert!(proceed_until(&mut mgr, 20, |m| !m.contains(h)));
    assert!(!mgr.is_scheduled(h));
    assert_eq!(free_requests(&cluster), 1);
    assert_eq!(mgr.metrics().segments_reclaimed, 1);
    assert_eq!(cluster.stored_replicas(ServerId(1)), 0);
}

/// Freeing a segment that never issued anything tells no backup.
#[test]
fn test_free_without_coordinator() {
    let cluster = SimulatedCluster::with_backups(3);
    let mut mgr = BackupManager::new(
        None,
        cluster.transport(),
        MASTER,
        ReplicationConfig::with_replicas(2),
    )
    .unwrap();
    let h = mgr.open_segment(1, Bytes::from_static(FOURTEEN)).unwrap();
    for _ in 0..5 {
        mgr.proceed();
    }
    assert_eq!(
        mgr.replica_phases(h).unwrap(),
        vec![ReplicaPhase::Unassigned; 2]
    );

    mgr.free(h).unwrap();
    assert!(proceed_until(&mut mgr, 5, |m| !m.contains(h)));
    assert!(cluster.requests().is_empty());
}

/// The legacy id-based free returns once frees are dispatched.
#[test]
fn test_legacy_free_segment() {
    let cluster = SimulatedCluster::with_backups(3);
    cluster.set_latency(3);
    let mut mgr = manager(&cluster, 3);
    let h = mgr.open_segment(8, Bytes::from_static(FOURTEEN)).unwrap();
    mgr.sync();

    mgr.free_segment(8).unwrap();
    assert_eq!(free_requests(&cluster), 3);
    assert!(mgr.contains(h));
    assert_eq!(
        mgr.replica_phases(h).unwrap(),
        vec![ReplicaPhase::FreePending; 3]
    );

    assert!(proceed_until(&mut mgr, 20, |m| !m.contains(h)));
    let err = mgr.free_segment(8).unwrap_err();
    assert_eq!(err.kind, ReplicationErrorKind::UnknownSegment);
}

/// A free requested mid-open goes out once the open completes.
#[test]
fn test_free_while_open_in_flight() {
    let cluster = SimulatedCluster::with_backups(3);
    cluster.set_latency(2);
    let mut mgr = manager(&cluster, 3);
    let h = mgr.open_segment(1, Bytes::from_static(FOURTEEN)).unwrap();
    mgr.proceed();
    mgr.free(h).unwrap();

    assert!(proceed_until(&mut mgr, 30, |m| !m.contains(h)));
    assert_eq!(free_requests(&cluster), 3);
    for backup in 1..=3 {
        assert_eq!(cluster.stored_replicas(ServerId(backup)), 0);
    }
}

/// A free that times out on a live backup is sent again.
#[test]
fn test_failed_free_is_retried() {
    let cluster = SimulatedCluster::with_backups(1);
    let mut mgr = manager(&cluster, 1);
    let h = mgr.open_segment(1, Bytes::from_static(FOURTEEN)).unwrap();
    mgr.sync();

    cluster.fail_next(ServerId(1), 1);
    mgr.free(h).unwrap();
    assert!(proceed_until(&mut mgr, 20, |m| !m.contains(h)));

    assert_eq!(free_requests(&cluster), 2);
    assert_eq!(mgr.metrics().rpc_failures, 1);
    assert_eq!(cluster.stored_replicas(ServerId(1)), 0);
}

/// A free the backup rejects is sent again until it is acknowledged.
#[test]
fn test_rejected_free_is_retried() {
    let cluster = SimulatedCluster::with_backups(1);
    let mut mgr = manager(&cluster, 1);
    let h = mgr.open_segment(1, Bytes::from_static(FOURTEEN)).unwrap();
    mgr.sync();

    cluster.reject_next(ServerId(1), 2);
    mgr.free(h).unwrap();
    mgr.proceed();
    mgr.proceed();
    assert!(mgr.contains(h));
    assert_eq!(
        cluster.replica(ServerId(1), MASTER, 1).unwrap(),
        FOURTEEN.to_vec()
    );

    assert!(proceed_until(&mut mgr, 20, |m| !m.contains(h)));
    assert_eq!(free_requests(&cluster), 3);
    assert_eq!(mgr.metrics().rpc_failures, 2);
    assert_eq!(cluster.stored_replicas(ServerId(1)), 0);
}

/// A free to a backup that has since left the cluster is dropped.
#[test]
fn test_free_to_departed_backup_is_dropped() {
    let cluster = SimulatedCluster::with_backups(2);
    let mut mgr = manager(&cluster, 2);
    let h = mgr.open_segment(1, Bytes::from_static(FOURTEEN)).unwrap();
    mgr.sync();

    cluster.kill(ServerId(2));
    mgr.free(h).unwrap();
    assert!(proceed_until(&mut mgr, 20, |m| !m.contains(h)));
    assert_eq!(free_requests(&cluster), 1);
}

// =============================================================================
// Teardown and pool
// =============================================================================

/// Dropping the manager syncs, drains frees and reclaims everything.
#[test]
fn test_teardown_drains_and_reclaims() {
    let cluster = SimulatedCluster::with_backups(3);
    cluster.set_latency(2);
    {
        let mut mgr = manager(&cluster, 3);
        mgr.open_segment(1, Bytes::from_static(FOURTEEN)).unwrap();
        let h2 = mgr.open_segment(2, Bytes::from_static(FOURTEEN)).unwrap();
        mgr.proceed();
        mgr.free(h2).unwrap();
    }

    assert_eq!(cluster.pending_rpcs(), 0);
    for backup in 1..=3 {
        let id = ServerId(backup);
        assert_eq!(cluster.replica(id, MASTER, 1).unwrap(), FOURTEEN.to_vec());
        assert_eq!(cluster.replica(id, MASTER, 2), None);
    }
}

/// Pool exhaustion is fatal; reclaimed entries become available again.
#[test]
fn test_pool_exhaustion() {
    let cluster = SimulatedCluster::with_backups(3);
    let mut mgr = manager_with(&cluster, ReplicationConfig::with_replicas(1).pool_capacity(2));

    let h1 = mgr.open_segment(1, Bytes::from_static(FOURTEEN)).unwrap();
    mgr.open_segment(2, Bytes::from_static(FOURTEEN)).unwrap();
    let err = mgr.open_segment(3, Bytes::from_static(FOURTEEN)).unwrap_err();
    assert_eq!(err.kind, ReplicationErrorKind::PoolExhausted);
    assert!(err.is_fatal());
    assert_eq!(mgr.tracked_segments(), vec![1, 2]);

    mgr.free(h1).unwrap();
    assert!(proceed_until(&mut mgr, 20, |m| !m.contains(h1)));
    assert!(mgr.open_segment(3, Bytes::from_static(FOURTEEN)).is_ok());
}
