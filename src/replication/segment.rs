//! Replicated Segment State Machine
//!
//! One instance per open log segment. Segment-level states:
//! - Unstarted: no request issued yet
//! - Replicating: at least one replica behind the queued length
//! - Synced: every replica acknowledged the full queued length
//!
//! Orthogonal free track: NotRequested -> Requested -> (retired by the manager).
//!
//! Per-replica states:
//! `Unassigned -> OpenPending -> OpenAcked -> WritePending -> WriteAcked
//! (repeats as data is queued) -> FreePending -> Freed`.
//! A failed open or write rolls the replica back to `Unassigned` and the
//! segment retries on a later pass with a fresh backup.
//!
//! The step function is only driven by the scheduler. It never blocks: it
//! polls outstanding requests and issues new ones, then tells the
//! scheduler whether it wants another pass.

use bytes::Bytes;

use super::errors::{ReplicationError, ReplicationResult};
use super::identity::{SegmentId, ServerId};
use super::selector::BackupSelector;
use super::transport::{BackupTransport, RpcError, RpcId, RpcStatus};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry, RpcKind};
use crate::scheduler::TaskOutcome;

/// Externally visible phase of one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaPhase {
    Unassigned,
    OpenPending,
    OpenAcked,
    WritePending,
    WriteAcked,
    FreePending,
    Freed,
}

/// Replication phase of a whole segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPhase {
    /// No request issued yet
    Unstarted,
    /// Replicas are behind the queued data
    Replicating,
    /// Every replica acknowledged all queued data
    Synced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplicaState {
    Unassigned,
    OpenPending {
        backup: ServerId,
        rpc: RpcId,
        covers: u32,
        close: bool,
    },
    OpenAcked {
        backup: ServerId,
    },
    WritePending {
        backup: ServerId,
        rpc: RpcId,
        covers: u32,
        close: bool,
    },
    WriteAcked {
        backup: ServerId,
    },
    FreePending {
        backup: ServerId,
        rpc: RpcId,
    },
    Freed,
}

impl ReplicaState {
    fn backup(&self) -> Option<ServerId> {
        match self {
            ReplicaState::OpenPending { backup, .. }
            | ReplicaState::OpenAcked { backup }
            | ReplicaState::WritePending { backup, .. }
            | ReplicaState::WriteAcked { backup }
            | ReplicaState::FreePending { backup, .. } => Some(*backup),
            ReplicaState::Unassigned | ReplicaState::Freed => None,
        }
    }

    fn pending_rpc(&self) -> Option<RpcId> {
        match self {
            ReplicaState::OpenPending { rpc, .. }
            | ReplicaState::WritePending { rpc, .. }
            | ReplicaState::FreePending { rpc, .. } => Some(*rpc),
            _ => None,
        }
    }

    fn phase(&self) -> ReplicaPhase {
        match self {
            ReplicaState::Unassigned => ReplicaPhase::Unassigned,
            ReplicaState::OpenPending { .. } => ReplicaPhase::OpenPending,
            ReplicaState::OpenAcked { .. } => ReplicaPhase::OpenAcked,
            ReplicaState::WritePending { .. } => ReplicaPhase::WritePending,
            ReplicaState::WriteAcked { .. } => ReplicaPhase::WriteAcked,
            ReplicaState::FreePending { .. } => ReplicaPhase::FreePending,
            ReplicaState::Freed => ReplicaPhase::Freed,
        }
    }

    /// Assigned with no request in flight
    fn idle_backup(&self) -> Option<ServerId> {
        match self {
            ReplicaState::OpenAcked { backup } | ReplicaState::WriteAcked { backup } => {
                Some(*backup)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Replica {
    state: ReplicaState,
    /// Bytes this backup acknowledged as durably stored
    acked: u32,
    /// Backup acknowledged a request carrying the close flag
    close_acked: bool,
}

impl Replica {
    fn unassigned() -> Self {
        Self {
            state: ReplicaState::Unassigned,
            acked: 0,
            close_acked: false,
        }
    }

    fn reset(&mut self) {
        *self = Self::unassigned();
    }
}

/// Everything a segment needs from its manager to take one step
pub(crate) struct StepContext<'a> {
    pub max_rpc_bytes: u32,
    pub selector: &'a mut BackupSelector,
    pub transport: &'a mut dyn BackupTransport,
    pub metrics: &'a MetricsRegistry,
    /// Open and write requests in flight across all segments
    pub outstanding_rpcs: &'a mut u32,
}

/// Replication state of one log segment
#[derive(Debug)]
pub struct ReplicatedSegment {
    master: ServerId,
    segment_id: SegmentId,
    /// Caller's bytes; only ever sliced, never copied
    data: Bytes,
    queued: u32,
    closed: bool,
    free_requested: bool,
    started: bool,
    replicas: Vec<Replica>,
    /// Backups that failed a request for this segment since the last reset
    failed_backups: Vec<ServerId>,
    selection_stalled: bool,
    reported_synced: bool,
}

impl ReplicatedSegment {
    /// Create replication state for `data` with `num_replicas` empty slots.
    ///
    /// `data` must fit in a u32 length; the manager enforces this.
    pub(crate) fn new(
        master: ServerId,
        segment_id: SegmentId,
        data: Bytes,
        num_replicas: u32,
    ) -> Self {
        let queued = data.len() as u32;
        Self {
            master,
            segment_id,
            data,
            queued,
            closed: false,
            free_requested: false,
            started: false,
            replicas: (0..num_replicas).map(|_| Replica::unassigned()).collect(),
            failed_backups: Vec::new(),
            selection_stalled: false,
            reported_synced: false,
        }
    }

    /// Segment identifier
    pub fn id(&self) -> SegmentId {
        self.segment_id
    }

    /// Owning master
    pub fn master(&self) -> ServerId {
        self.master
    }

    /// Bytes queued for replication
    pub fn queued_bytes(&self) -> u32 {
        self.queued
    }

    /// Desired number of replicas
    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    /// True once the log layer closed the segment
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True once a free has been requested
    pub fn is_free_requested(&self) -> bool {
        self.free_requested
    }

    /// Phase of every replica slot, in slot order
    pub fn replica_phases(&self) -> Vec<ReplicaPhase> {
        self.replicas.iter().map(|r| r.state.phase()).collect()
    }

    /// Acknowledged bytes of every replica slot, in slot order
    pub fn replica_acked_bytes(&self) -> Vec<u32> {
        self.replicas.iter().map(|r| r.acked).collect()
    }

    /// Assigned backup of every replica slot, in slot order
    pub fn replica_backups(&self) -> Vec<Option<ServerId>> {
        self.replicas.iter().map(|r| r.state.backup()).collect()
    }

    /// Computed from slot state on every call.
    pub fn is_synced(&self) -> bool {
        self.replicas.iter().all(|r| {
            r.state.idle_backup().is_some()
                && r.acked == self.queued
                && (!self.closed || r.close_acked)
        })
    }

    /// Synced, counting only replicas whose backup satisfies `is_live`.
    pub fn is_synced_on(&self, is_live: impl Fn(ServerId) -> bool) -> bool {
        self.is_synced()
            && self
                .replicas
                .iter()
                .filter_map(|r| r.state.backup())
                .all(is_live)
    }

    /// Current segment-level phase
    pub fn phase(&self) -> SegmentPhase {
        if self.is_synced() {
            SegmentPhase::Synced
        } else if !self.started {
            SegmentPhase::Unstarted
        } else {
            SegmentPhase::Replicating
        }
    }

    /// True while an open or write request is in flight
    pub fn has_outstanding_writes(&self) -> bool {
        self.replicas.iter().any(|r| {
            matches!(
                r.state,
                ReplicaState::OpenPending { .. } | ReplicaState::WritePending { .. }
            )
        })
    }

    /// True while any request is in flight
    pub fn has_outstanding_rpcs(&self) -> bool {
        self.replicas.iter().any(|r| r.state.pending_rpc().is_some())
    }

    /// True once every assigned replica was sent its free request.
    pub fn free_dispatched(&self) -> bool {
        self.free_requested
            && self.replicas.iter().all(|r| {
                matches!(
                    r.state,
                    ReplicaState::Unassigned
                        | ReplicaState::FreePending { .. }
                        | ReplicaState::Freed
                )
            })
    }

    /// True once every slot is freed or was never assigned
    pub fn is_fully_freed(&self) -> bool {
        self.free_requested
            && self
                .replicas
                .iter()
                .all(|r| matches!(r.state, ReplicaState::Unassigned | ReplicaState::Freed))
    }

    /// Queue a longer view of the segment for replication.
    pub(crate) fn queue_write(&mut self, data: Bytes) -> ReplicationResult<()> {
        if self.free_requested {
            return Err(ReplicationError::invalid_write(format!(
                "segment {} is being freed",
                self.segment_id
            )));
        }
        if self.closed {
            return Err(ReplicationError::invalid_write(format!(
                "segment {} is closed",
                self.segment_id
            )));
        }
        if data.len() < self.queued as usize {
            return Err(ReplicationError::invalid_write(format!(
                "segment {} would shrink from {} to {} bytes",
                self.segment_id,
                self.queued,
                data.len()
            )));
        }
        if data.len() > u32::MAX as usize {
            return Err(ReplicationError::invalid_write(format!(
                "segment {} exceeds {} bytes",
                self.segment_id,
                u32::MAX
            )));
        }
        self.queued = data.len() as u32;
        self.data = data;
        self.reported_synced = false;
        Ok(())
    }

    /// Mark the segment closed. Returns false if it already was.
    pub(crate) fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.reported_synced = false;
        true
    }

    /// Mark the segment for freeing. Returns false if it already was.
    pub(crate) fn request_free(&mut self) -> bool {
        if self.free_requested {
            return false;
        }
        self.free_requested = true;
        true
    }

    /// React to a cluster change: give previously failed backups another
    /// chance.
    pub(crate) fn rearm(&mut self) {
        self.failed_backups.clear();
    }

    /// Take one non-blocking step. Replicas are serviced in slot order.
    pub(crate) fn perform_task(&mut self, ctx: &mut StepContext<'_>) -> TaskOutcome {
        for slot in 0..self.replicas.len() {
            // A replica that just failed is retried on the next pass.
            if self.poll_replica(slot, ctx) {
                self.advance_replica(slot, ctx);
            }
        }
        self.outcome()
    }

    /// Poll the replica's outstanding request, if any. Returns false when
    /// the request failed.
    fn poll_replica(&mut self, slot: usize, ctx: &mut StepContext<'_>) -> bool {
        let rpc = match self.replicas[slot].state.pending_rpc() {
            Some(rpc) => rpc,
            None => return true,
        };

        match ctx.transport.poll(rpc) {
            RpcStatus::Pending => true,
            RpcStatus::Completed => {
                self.complete_replica(slot, ctx);
                true
            }
            RpcStatus::Failed(err) => {
                self.fail_replica(slot, err, ctx);
                false
            }
        }
    }

    fn complete_replica(&mut self, slot: usize, ctx: &mut StepContext<'_>) {
        let queued = self.queued;
        let replica = &mut self.replicas[slot];
        match replica.state.clone() {
            ReplicaState::OpenPending {
                backup,
                covers,
                close,
                ..
            } => {
                assert!(covers <= queued, "acknowledged bytes beyond segment length");
                *ctx.outstanding_rpcs -= 1;
                replica.acked = covers;
                replica.close_acked |= close;
                replica.state = ReplicaState::OpenAcked { backup };
            }
            ReplicaState::WritePending {
                backup,
                covers,
                close,
                ..
            } => {
                assert!(covers <= queued, "acknowledged bytes beyond segment length");
                assert!(covers >= replica.acked, "write acknowledged out of order");
                *ctx.outstanding_rpcs -= 1;
                replica.acked = covers;
                replica.close_acked |= close;
                replica.state = ReplicaState::WriteAcked { backup };
            }
            ReplicaState::FreePending { .. } => {
                replica.state = ReplicaState::Freed;
            }
            _ => {}
        }
    }

    fn fail_replica(&mut self, slot: usize, err: RpcError, ctx: &mut StepContext<'_>) {
        let state = self.replicas[slot].state.clone();
        let backup = match state.backup() {
            Some(backup) => backup,
            None => return,
        };

        ctx.metrics.increment_rpc_failures();
        let segment = self.segment_id.to_string();
        let backup_name = backup.to_string();
        let reason = err.to_string();
        log_event_with_fields(
            Event::ReplicaFailed,
            &[
                ("backup", &backup_name),
                ("phase", &format!("{:?}", state.phase())),
                ("reason", &reason),
                ("segment", &segment),
            ],
        );

        match state {
            ReplicaState::OpenPending { .. } | ReplicaState::WritePending { .. } => {
                *ctx.outstanding_rpcs -= 1;
                self.replicas[slot].reset();
                if !self.failed_backups.contains(&backup) {
                    self.failed_backups.push(backup);
                }
            }
            ReplicaState::FreePending { .. } => {
                self.replicas[slot].state = if ctx.selector.is_live(backup) {
                    // Idle again; the free is reissued.
                    ReplicaState::WriteAcked { backup }
                } else {
                    // The backup is gone and its copy with it.
                    ReplicaState::Freed
                };
            }
            _ => {}
        }
    }

    fn advance_replica(&mut self, slot: usize, ctx: &mut StepContext<'_>) {
        if let Some(backup) = self.replicas[slot].state.idle_backup() {
            if !ctx.selector.is_live(backup) {
                self.lose_replica(slot, backup, ctx);
            } else if self.free_requested {
                self.free_replica(slot, backup, ctx);
                return;
            } else {
                let replica = &self.replicas[slot];
                if replica.acked < self.queued || (self.closed && !replica.close_acked) {
                    self.write_replica(slot, backup, ctx);
                }
                return;
            }
        }

        if self.replicas[slot].state == ReplicaState::Unassigned && !self.free_requested {
            self.open_replica(slot, ctx);
        }
    }

    /// The backup left the cluster while holding an idle replica.
    fn lose_replica(&mut self, slot: usize, backup: ServerId, ctx: &mut StepContext<'_>) {
        ctx.metrics.increment_replicas_lost();
        let segment = self.segment_id.to_string();
        let backup_name = backup.to_string();
        log_event_with_fields(
            Event::ReplicaLost,
            &[("backup", &backup_name), ("segment", &segment)],
        );
        if self.free_requested {
            self.replicas[slot].state = ReplicaState::Freed;
        } else {
            self.replicas[slot].reset();
            self.reported_synced = false;
        }
    }

    fn open_replica(&mut self, slot: usize, ctx: &mut StepContext<'_>) {
        let mut excluding: Vec<ServerId> =
            self.replicas.iter().filter_map(|r| r.state.backup()).collect();
        excluding.extend(self.failed_backups.iter().copied());

        let backup = match ctx.selector.select(&excluding) {
            Ok(backup) => backup,
            Err(err) => {
                ctx.metrics.increment_selection_failures();
                if !self.selection_stalled {
                    self.selection_stalled = true;
                    let segment = self.segment_id.to_string();
                    log_event_with_fields(
                        Event::BackupSelectionFailed,
                        &[("reason", &err.message), ("segment", &segment)],
                    );
                }
                // Let backups that failed before compete again next pass.
                self.failed_backups.clear();
                return;
            }
        };
        self.selection_stalled = false;

        let end = self.queued.min(ctx.max_rpc_bytes);
        let close = self.closed && end == self.queued;
        let payload = self.data.slice(0..end as usize);
        let rpc = ctx
            .transport
            .open_and_write(backup, self.master, self.segment_id, payload, close);

        *ctx.outstanding_rpcs += 1;
        ctx.metrics.record_rpc(RpcKind::Open, end as u64);
        self.started = true;
        self.replicas[slot].state = ReplicaState::OpenPending {
            backup,
            rpc,
            covers: end,
            close,
        };
        self.trace_issue(Event::ReplicaOpenIssued, backup, 0, end);
    }

    fn write_replica(&mut self, slot: usize, backup: ServerId, ctx: &mut StepContext<'_>) {
        let offset = self.replicas[slot].acked;
        let end = offset.saturating_add(ctx.max_rpc_bytes).min(self.queued);
        let close = self.closed && end == self.queued;
        let payload = self.data.slice(offset as usize..end as usize);
        let rpc = ctx.transport.write(
            backup,
            self.master,
            self.segment_id,
            offset,
            payload,
            close,
        );

        *ctx.outstanding_rpcs += 1;
        ctx.metrics.record_rpc(RpcKind::Write, (end - offset) as u64);
        self.replicas[slot].state = ReplicaState::WritePending {
            backup,
            rpc,
            covers: end,
            close,
        };
        self.trace_issue(Event::ReplicaWriteIssued, backup, offset, end);
    }

    fn free_replica(&mut self, slot: usize, backup: ServerId, ctx: &mut StepContext<'_>) {
        let rpc = ctx
            .transport
            .free_segment(backup, self.master, self.segment_id);
        ctx.metrics.record_rpc(RpcKind::Free, 0);
        self.replicas[slot].state = ReplicaState::FreePending { backup, rpc };

        let segment = self.segment_id.to_string();
        let backup_name = backup.to_string();
        log_event_with_fields(
            Event::ReplicaFreeIssued,
            &[("backup", &backup_name), ("segment", &segment)],
        );
    }

    fn trace_issue(&self, event: Event, backup: ServerId, offset: u32, end: u32) {
        let segment = self.segment_id.to_string();
        let backup_name = backup.to_string();
        let offset = offset.to_string();
        let end = end.to_string();
        log_event_with_fields(
            event,
            &[
                ("backup", &backup_name),
                ("end", &end),
                ("offset", &offset),
                ("segment", &segment),
            ],
        );
    }

    fn outcome(&mut self) -> TaskOutcome {
        if self.free_requested {
            if self.is_fully_freed() {
                return TaskOutcome::Retire;
            }
            return TaskOutcome::Reschedule;
        }

        if self.has_outstanding_rpcs() {
            return TaskOutcome::Reschedule;
        }

        if !self.is_synced() {
            // Unassigned slots retry selection; idle slots behind the
            // queued length were just issued a write above.
            return TaskOutcome::Reschedule;
        }

        if !self.reported_synced {
            self.reported_synced = true;
            let segment = self.segment_id.to_string();
            let bytes = self.queued.to_string();
            log_event_with_fields(
                Event::SegmentSynced,
                &[("bytes", &bytes), ("segment", &segment)],
            );
        }
        TaskOutcome::Idle
    }
}
