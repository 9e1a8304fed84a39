//! Observable replication events
//!
//! Events are explicit and typed. Each maps to a fixed upper-case name and
//! a default severity.

use std::fmt;

use super::logger::Severity;

/// Observable events in the replication core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Segment lifecycle
    /// Segment registered for replication
    SegmentOpened,
    /// More data queued for a segment
    SegmentWriteQueued,
    /// Segment closed by the log layer
    SegmentClosed,
    /// All replicas acknowledged the full segment
    SegmentSynced,
    /// Free requested for a segment
    SegmentFreeRequested,
    /// Segment reclaimed into the pool
    SegmentReclaimed,

    // Replica requests
    /// Open request issued to a backup
    ReplicaOpenIssued,
    /// Incremental write issued to a backup
    ReplicaWriteIssued,
    /// Free request issued to a backup
    ReplicaFreeIssued,
    /// A backup request failed; replica rolled back
    ReplicaFailed,
    /// Replica dropped because its backup left the cluster
    ReplicaLost,
    /// No eligible backup for a replica this pass
    BackupSelectionFailed,

    // Manager
    /// Cluster membership changed, all segments re-armed
    ClusterChanged,
    /// Segment pool has no free entries (FATAL)
    PoolExhausted,

    // Scopes, logged as `{name}_BEGIN` and `{name}_COMPLETE`
    /// Blocking sync
    Sync,
    /// Manager teardown
    Shutdown,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::SegmentOpened => "SEGMENT_OPENED",
            Event::SegmentWriteQueued => "SEGMENT_WRITE_QUEUED",
            Event::SegmentClosed => "SEGMENT_CLOSED",
            Event::SegmentSynced => "SEGMENT_SYNCED",
            Event::SegmentFreeRequested => "SEGMENT_FREE_REQUESTED",
            Event::SegmentReclaimed => "SEGMENT_RECLAIMED",

            Event::ReplicaOpenIssued => "REPLICA_OPEN_ISSUED",
            Event::ReplicaWriteIssued => "REPLICA_WRITE_ISSUED",
            Event::ReplicaFreeIssued => "REPLICA_FREE_ISSUED",
            Event::ReplicaFailed => "REPLICA_FAILED",
            Event::ReplicaLost => "REPLICA_LOST",
            Event::BackupSelectionFailed => "BACKUP_SELECTION_FAILED",

            Event::ClusterChanged => "CLUSTER_CONFIGURATION_CHANGED",
            Event::PoolExhausted => "SEGMENT_POOL_EXHAUSTED",
            Event::Sync => "SYNC",
            Event::Shutdown => "SHUTDOWN",
        }
    }

    /// Severity the event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::ReplicaOpenIssued
            | Event::ReplicaWriteIssued
            | Event::ReplicaFreeIssued
            | Event::SegmentWriteQueued => Severity::Trace,
            Event::ReplicaFailed | Event::ReplicaLost | Event::BackupSelectionFailed => {
                Severity::Warn
            }
            Event::PoolExhausted => Severity::Fatal,
            _ => Severity::Info,
        }
    }

    /// Returns true if this event indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
