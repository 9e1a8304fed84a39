//! Replication metrics registry
//!
//! - Counters only, monotonic
//! - Reset only when a new registry is created
//! - Lock-free; the replication core is single-threaded but readers
//!   may snapshot from elsewhere

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of backup requests, for per-kind counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    /// Open + initial bytes
    Open,
    /// Incremental write
    Write,
    /// Free replica
    Free,
}

/// Registry of replication counters
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    segments_opened: AtomicU64,
    segments_reclaimed: AtomicU64,
    open_rpcs: AtomicU64,
    write_rpcs: AtomicU64,
    free_rpcs: AtomicU64,
    rpc_failures: AtomicU64,
    replicas_lost: AtomicU64,
    bytes_sent: AtomicU64,
    scheduler_passes: AtomicU64,
    cluster_changes: AtomicU64,
    selection_failures: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_segments_opened(&self) {
        self.segments_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_segments_reclaimed(&self) {
        self.segments_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an issued request and the payload bytes it carries
    pub fn record_rpc(&self, kind: RpcKind, payload_bytes: u64) {
        let counter = match kind {
            RpcKind::Open => &self.open_rpcs,
            RpcKind::Write => &self.write_rpcs,
            RpcKind::Free => &self.free_rpcs,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(payload_bytes, Ordering::Relaxed);
    }

    pub fn increment_rpc_failures(&self) {
        self.rpc_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_replicas_lost(&self) {
        self.replicas_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_scheduler_passes(&self) {
        self.scheduler_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_cluster_changes(&self) {
        self.cluster_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_selection_failures(&self) {
        self.selection_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Total payload bytes sent to backups
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            taken_at: Utc::now(),
            segments_opened: self.segments_opened.load(Ordering::Relaxed),
            segments_reclaimed: self.segments_reclaimed.load(Ordering::Relaxed),
            open_rpcs: self.open_rpcs.load(Ordering::Relaxed),
            write_rpcs: self.write_rpcs.load(Ordering::Relaxed),
            free_rpcs: self.free_rpcs.load(Ordering::Relaxed),
            rpc_failures: self.rpc_failures.load(Ordering::Relaxed),
            replicas_lost: self.replicas_lost.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            scheduler_passes: self.scheduler_passes.load(Ordering::Relaxed),
            cluster_changes: self.cluster_changes.load(Ordering::Relaxed),
            selection_failures: self.selection_failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub segments_opened: u64,
    pub segments_reclaimed: u64,
    pub open_rpcs: u64,
    pub write_rpcs: u64,
    pub free_rpcs: u64,
    pub rpc_failures: u64,
    pub replicas_lost: u64,
    pub bytes_sent: u64,
    pub scheduler_passes: u64,
    pub cluster_changes: u64,
    pub selection_failures: u64,
}

impl MetricsSnapshot {
    /// Serialize to a JSON object
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
