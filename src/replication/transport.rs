//! Collaborator interfaces: backup transport and cluster membership
//!
//! Both are consumed, never implemented, by the replication core. Requests
//! are fire-and-poll: issuing never blocks and polling never blocks.

use bytes::Bytes;
use thiserror::Error;

use super::identity::{SegmentId, ServerId};

/// Identifier of an issued backup request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RpcId(pub u64);

/// Failure reported by a backup request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The backup could not be reached or crashed mid-request
    #[error("backup {0} is unreachable")]
    Unreachable(ServerId),

    /// The backup explicitly rejected the request
    #[error("backup {backup} rejected the request: {reason}")]
    Rejected { backup: ServerId, reason: String },

    /// The transport has no record of this request
    #[error("unknown rpc {0:?}")]
    UnknownRpc(RpcId),
}

/// Non-blocking completion state of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcStatus {
    /// Still in flight
    Pending,
    /// Acknowledged by the backup
    Completed,
    /// Terminal failure
    Failed(RpcError),
}

impl RpcStatus {
    /// True for `Completed` and `Failed`
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RpcStatus::Pending)
    }
}

/// Non-blocking request surface to backup servers.
///
/// Once `poll` has returned a terminal status for an id, the transport may
/// forget it; polling it again yields `Failed(UnknownRpc)`.
pub trait BackupTransport {
    /// Open a replica on `backup` and write `data` at offset 0.
    fn open_and_write(
        &mut self,
        backup: ServerId,
        master: ServerId,
        segment: SegmentId,
        data: Bytes,
        close: bool,
    ) -> RpcId;

    /// Append `data` to an open replica at `offset`.
    fn write(
        &mut self,
        backup: ServerId,
        master: ServerId,
        segment: SegmentId,
        offset: u32,
        data: Bytes,
        close: bool,
    ) -> RpcId;

    /// Ask `backup` to discard its replica.
    fn free_segment(&mut self, backup: ServerId, master: ServerId, segment: SegmentId) -> RpcId;

    /// Check a request without blocking.
    fn poll(&mut self, rpc: RpcId) -> RpcStatus;
}

/// Query surface of the cluster coordinator
pub trait ClusterMembership {
    /// Backups currently believed reachable, in any order.
    fn live_backups(&self) -> Vec<ServerId>;
}
