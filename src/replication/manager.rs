//! Backup Manager
//!
//! Entry point for the log layer. Owns the segment pool, the scheduler and
//! the list of tracked segments for one master.
//!
//! - `open_segment` never performs I/O; it only registers work
//! - `proceed` runs one non-blocking scheduler pass
//! - `sync` is the only blocking operation
//! - `cluster_configuration_changed` re-arms every tracked segment
//! - Teardown syncs, drains, then reclaims everything that is left

use std::collections::HashMap;

use bytes::Bytes;

use super::config::ReplicationConfig;
use super::errors::{ReplicationError, ReplicationResult};
use super::identity::{SegmentId, ServerId};
use super::pool::{SegmentHandle, SegmentPool};
use super::segment::{ReplicaPhase, ReplicatedSegment, SegmentPhase, StepContext};
use super::selector::BackupSelector;
use super::transport::{BackupTransport, ClusterMembership};
use crate::observability::{
    log_event_with_fields, Event, MetricsRegistry, MetricsSnapshot, ObservationScope,
};
use crate::scheduler::{TaskManager, TaskOutcome};

/// Replication manager for one master's log segments
pub struct BackupManager {
    master_id: ServerId,
    config: ReplicationConfig,
    selector: BackupSelector,
    transport: Box<dyn BackupTransport>,
    tasks: TaskManager<SegmentHandle>,
    pool: SegmentPool<ReplicatedSegment>,
    /// Tracked segments in open order
    tracked: Vec<SegmentHandle>,
    by_id: HashMap<SegmentId, SegmentHandle>,
    /// Open and write requests in flight
    outstanding_rpcs: u32,
    metrics: MetricsRegistry,
    shut_down: bool,
}

impl BackupManager {
    /// Create a manager.
    ///
    /// `coordinator` may be `None` in tests, in which case no backup is
    /// ever eligible and only `num_replicas == 0` segments become synced.
    pub fn new(
        coordinator: Option<Box<dyn ClusterMembership>>,
        transport: Box<dyn BackupTransport>,
        master_id: ServerId,
        config: ReplicationConfig,
    ) -> ReplicationResult<Self> {
        config.validate()?;
        Ok(Self {
            master_id,
            selector: BackupSelector::new(coordinator),
            transport,
            tasks: TaskManager::new(),
            pool: SegmentPool::with_capacity(config.pool_capacity),
            tracked: Vec::new(),
            by_id: HashMap::new(),
            outstanding_rpcs: 0,
            metrics: MetricsRegistry::new(),
            shut_down: false,
            config,
        })
    }

    /// Begin replicating a new segment.
    ///
    /// `data` is the segment's bytes so far; it must fit in one request.
    /// No request is issued until the next `proceed`.
    pub fn open_segment(
        &mut self,
        segment_id: SegmentId,
        data: Bytes,
    ) -> ReplicationResult<SegmentHandle> {
        if self.by_id.contains_key(&segment_id) {
            return Err(ReplicationError::duplicate_segment(format!(
                "segment {} is already open for {}",
                segment_id, self.master_id
            )));
        }
        if data.len() > self.config.max_rpc_bytes as usize {
            return Err(ReplicationError::payload_too_large(format!(
                "segment {} opened with {} bytes, limit is {}",
                segment_id,
                data.len(),
                self.config.max_rpc_bytes
            )));
        }

        let bytes = data.len().to_string();
        let segment = ReplicatedSegment::new(
            self.master_id,
            segment_id,
            data,
            self.config.num_replicas,
        );
        let handle = match self.pool.allocate(segment) {
            Ok(handle) => handle,
            Err(_) => {
                let capacity = self.pool.capacity().to_string();
                let id = segment_id.to_string();
                log_event_with_fields(
                    Event::PoolExhausted,
                    &[("capacity", &capacity), ("segment", &id)],
                );
                return Err(ReplicationError::pool_exhausted(format!(
                    "all {} segment entries in use; segments are not being freed",
                    capacity
                )));
            }
        };

        self.tracked.push(handle);
        self.by_id.insert(segment_id, handle);
        self.tasks.schedule(handle);
        self.metrics.increment_segments_opened();

        let id = segment_id.to_string();
        log_event_with_fields(
            Event::SegmentOpened,
            &[("bytes", &bytes), ("segment", &id)],
        );
        Ok(handle)
    }

    /// Queue a longer view of the segment's bytes for replication.
    pub fn write(&mut self, handle: SegmentHandle, data: Bytes) -> ReplicationResult<()> {
        let segment = self.segment_mut(handle)?;
        segment.queue_write(data)?;
        let id = segment.id().to_string();
        let bytes = segment.queued_bytes().to_string();
        self.tasks.schedule(handle);
        log_event_with_fields(
            Event::SegmentWriteQueued,
            &[("bytes", &bytes), ("segment", &id)],
        );
        Ok(())
    }

    /// Close the segment. Replicas are told on their final write.
    pub fn close(&mut self, handle: SegmentHandle) -> ReplicationResult<()> {
        let segment = self.segment_mut(handle)?;
        if segment.is_free_requested() {
            return Err(ReplicationError::invalid_write(format!(
                "segment {} is being freed",
                segment.id()
            )));
        }
        if segment.close() {
            let id = segment.id().to_string();
            self.tasks.schedule(handle);
            log_event_with_fields(Event::SegmentClosed, &[("segment", &id)]);
        }
        Ok(())
    }

    /// Ask every replica of the segment to be discarded.
    ///
    /// The segment is reclaimed by a later pass once every assigned
    /// replica acknowledged the free. Freeing twice is a no-op.
    pub fn free(&mut self, handle: SegmentHandle) -> ReplicationResult<()> {
        let segment = self.segment_mut(handle)?;
        if segment.request_free() {
            let id = segment.id().to_string();
            self.tasks.schedule(handle);
            log_event_with_fields(Event::SegmentFreeRequested, &[("segment", &id)]);
        }
        Ok(())
    }

    /// Free a segment by id and drive passes until its free requests have
    /// gone out. Does not wait for backups to acknowledge.
    pub fn free_segment(&mut self, segment_id: SegmentId) -> ReplicationResult<()> {
        let handle = self.handle_for(segment_id).ok_or_else(|| {
            ReplicationError::unknown_segment(format!(
                "segment {} is not open for {}",
                segment_id, self.master_id
            ))
        })?;
        self.free(handle)?;

        while let Some(segment) = self.pool.get(handle) {
            if segment.free_dispatched() {
                break;
            }
            self.proceed();
        }
        Ok(())
    }

    /// True once every replica acknowledged all queued bytes and every
    /// assigned backup is still live. False for reclaimed segments.
    pub fn is_synced(&self, handle: SegmentHandle) -> bool {
        let selector = &self.selector;
        self.pool
            .get(handle)
            .map(|s| s.is_synced_on(|b| selector.is_live(b)))
            .unwrap_or(false)
    }

    /// True while the segment is waiting for a scheduler pass
    pub fn is_scheduled(&self, handle: SegmentHandle) -> bool {
        self.tasks.is_scheduled(handle)
    }

    /// True while the handle refers to a tracked segment
    pub fn contains(&self, handle: SegmentHandle) -> bool {
        self.pool.contains(handle)
    }

    /// Run one non-blocking scheduler pass. Returns the number of segments
    /// stepped; zero means nothing was ready and nothing changed.
    pub fn proceed(&mut self) -> usize {
        if self.tasks.ready_len() == 0 {
            return 0;
        }
        self.selector.begin_pass();

        let pool = &mut self.pool;
        let mut ctx = StepContext {
            max_rpc_bytes: self.config.max_rpc_bytes,
            selector: &mut self.selector,
            transport: self.transport.as_mut(),
            metrics: &self.metrics,
            outstanding_rpcs: &mut self.outstanding_rpcs,
        };
        let stepped = self.tasks.proceed(|handle| match pool.get_mut(handle) {
            Some(segment) => segment.perform_task(&mut ctx),
            None => TaskOutcome::Idle,
        });
        self.metrics.increment_scheduler_passes();

        for handle in self.tasks.take_retired() {
            self.destroy_and_free_replicated_segment(handle);
        }
        stepped
    }

    /// Block until every tracked segment is durable on live backups or
    /// being freed with no writes in flight.
    ///
    /// Stalls for as long as the cluster has too few live backups.
    pub fn sync(&mut self) {
        let tracked = self.tracked.len().to_string();
        let scope = ObservationScope::with_fields(Event::Sync.as_str(), &[("segments", &tracked)]);

        loop {
            self.selector.refresh();
            let mut settled = true;
            for handle in &self.tracked {
                let segment = match self.pool.get(*handle) {
                    Some(segment) => segment,
                    None => continue,
                };
                if self.is_settled(segment) {
                    continue;
                }
                settled = false;
                // Idle but no longer durable: a backup left without a
                // configuration change reaching us.
                self.tasks.schedule(*handle);
            }
            if settled {
                break;
            }
            self.proceed();
        }

        assert_eq!(
            self.outstanding_rpcs, 0,
            "sync finished with requests in flight"
        );
        scope.complete_with_fields(&[("passes", &self.tasks.passes().to_string())]);
    }

    /// React to a membership change: every tracked segment is re-armed and
    /// decides on its own whether it has anything to do.
    pub fn cluster_configuration_changed(&mut self) {
        let live = self.selector.refresh().len().to_string();
        self.metrics.increment_cluster_changes();

        for handle in &self.tracked {
            if let Some(segment) = self.pool.get_mut(*handle) {
                segment.rearm();
            }
            self.tasks.schedule(*handle);
        }

        let tracked = self.tracked.len().to_string();
        log_event_with_fields(
            Event::ClusterChanged,
            &[("live_backups", &live), ("segments", &tracked)],
        );
    }

    /// Sync, drain outstanding frees, then reclaim every remaining segment.
    ///
    /// Runs at most once; `Drop` calls it if the owner did not.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let scope = ObservationScope::new(Event::Shutdown.as_str());

        self.sync();
        while !self.tasks.is_idle() {
            self.proceed();
        }
        let remaining = self.tracked.clone();
        let reclaimed = remaining.len().to_string();
        for handle in remaining {
            self.destroy_and_free_replicated_segment(handle);
        }

        scope.complete_with_fields(&[("reclaimed", &reclaimed)]);
    }

    /// Only path that shrinks the tracked list.
    fn destroy_and_free_replicated_segment(&mut self, handle: SegmentHandle) {
        assert!(
            !self.tasks.is_scheduled(handle),
            "destroying segment {} while it is scheduled",
            handle
        );
        let segment = match self.pool.release(handle) {
            Some(segment) => segment,
            None => return,
        };
        assert!(
            !segment.has_outstanding_rpcs(),
            "destroying segment {} with requests in flight",
            segment.id()
        );

        self.tracked.retain(|h| *h != handle);
        self.by_id.remove(&segment.id());
        self.metrics.increment_segments_reclaimed();

        let id = segment.id().to_string();
        log_event_with_fields(Event::SegmentReclaimed, &[("segment", &id)]);
    }

    fn is_settled(&self, segment: &ReplicatedSegment) -> bool {
        if segment.is_free_requested() {
            !segment.has_outstanding_writes()
        } else {
            segment.is_synced_on(|b| self.selector.is_live(b))
        }
    }

    fn segment_mut(&mut self, handle: SegmentHandle) -> ReplicationResult<&mut ReplicatedSegment> {
        self.pool.get_mut(handle).ok_or_else(|| {
            ReplicationError::stale_handle(format!("segment handle {} was reclaimed", handle))
        })
    }

    fn segment_ref(&self, handle: SegmentHandle) -> ReplicationResult<&ReplicatedSegment> {
        self.pool.get(handle).ok_or_else(|| {
            ReplicationError::stale_handle(format!("segment handle {} was reclaimed", handle))
        })
    }

    // ----- Introspection -----

    /// Read-only view of a tracked segment
    pub fn segment(&self, handle: SegmentHandle) -> Option<&ReplicatedSegment> {
        self.pool.get(handle)
    }

    /// Handle of the open segment with this id
    pub fn handle_for(&self, segment_id: SegmentId) -> Option<SegmentHandle> {
        self.by_id.get(&segment_id).copied()
    }

    pub fn replica_phases(&self, handle: SegmentHandle) -> ReplicationResult<Vec<ReplicaPhase>> {
        Ok(self.segment_ref(handle)?.replica_phases())
    }

    pub fn replica_acked_bytes(&self, handle: SegmentHandle) -> ReplicationResult<Vec<u32>> {
        Ok(self.segment_ref(handle)?.replica_acked_bytes())
    }

    pub fn replica_backups(
        &self,
        handle: SegmentHandle,
    ) -> ReplicationResult<Vec<Option<ServerId>>> {
        Ok(self.segment_ref(handle)?.replica_backups())
    }

    pub fn segment_phase(&self, handle: SegmentHandle) -> ReplicationResult<SegmentPhase> {
        Ok(self.segment_ref(handle)?.phase())
    }

    /// Ids of tracked segments in open order
    pub fn tracked_segments(&self) -> Vec<SegmentId> {
        self.tracked
            .iter()
            .filter_map(|h| self.pool.get(*h))
            .map(|s| s.id())
            .collect()
    }

    /// Open and write requests currently in flight
    pub fn outstanding_rpcs(&self) -> u32 {
        self.outstanding_rpcs
    }

    /// True when no segment is waiting for a pass
    pub fn is_idle(&self) -> bool {
        self.tasks.is_idle()
    }

    /// Backups in the latest membership view
    pub fn live_backups(&self) -> &[ServerId] {
        self.selector.live_backups()
    }

    pub fn master_id(&self) -> ServerId {
        self.master_id
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for BackupManager {
    fn drop(&mut self) {
        // Never block an unwinding thread on replication.
        if !std::thread::panicking() {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupManager")
            .field("master_id", &self.master_id)
            .field("config", &self.config)
            .field("tracked", &self.tracked.len())
            .field("outstanding_rpcs", &self.outstanding_rpcs)
            .field("selector", &self.selector)
            .finish()
    }
}
