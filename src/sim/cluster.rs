//! In-process backup cluster
//!
//! Backs both collaborator traits with shared, single-threaded state so a
//! test can hand one clone to the manager as its coordinator, another as
//! its transport, and keep a third to kill backups or inspect replicas.
//!
//! Request effects are applied when a poll reports completion, never when
//! the request is issued.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::observability::RpcKind;
use crate::replication::{
    BackupTransport, ClusterMembership, RpcError, RpcId, RpcStatus, SegmentId, ServerId,
};

/// One issued request, as seen by the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub rpc: RpcId,
    pub kind: RpcKind,
    pub backup: ServerId,
    pub master: ServerId,
    pub segment: SegmentId,
    pub offset: u32,
    pub len: u32,
    pub close: bool,
}

#[derive(Debug, Default, Clone)]
struct StoredReplica {
    data: Vec<u8>,
    closed: bool,
}

#[derive(Debug, Default)]
struct BackupNode {
    alive: bool,
    replicas: HashMap<(ServerId, SegmentId), StoredReplica>,
}

#[derive(Debug)]
struct InFlight {
    backup: ServerId,
    master: ServerId,
    segment: SegmentId,
    op: Op,
    polls_left: u32,
    injected: Option<RpcError>,
}

#[derive(Debug)]
enum Op {
    Open { data: Bytes, close: bool },
    Write { offset: u32, data: Bytes, close: bool },
    Free,
}

#[derive(Debug, Default)]
struct ClusterState {
    backups: BTreeMap<ServerId, BackupNode>,
    in_flight: HashMap<RpcId, InFlight>,
    next_rpc: u64,
    latency_polls: u32,
    paused: bool,
    fail_next: HashMap<ServerId, u32>,
    reject_next: HashMap<ServerId, u32>,
    failure_rate: f64,
    rng: Option<StdRng>,
    requests: Vec<RequestRecord>,
}

impl ClusterState {
    fn issue(&mut self, backup: ServerId, master: ServerId, segment: SegmentId, op: Op) -> RpcId {
        self.next_rpc += 1;
        let rpc = RpcId(self.next_rpc);

        let (kind, offset, len, close) = match &op {
            Op::Open { data, close } => (RpcKind::Open, 0, data.len() as u32, *close),
            Op::Write {
                offset,
                data,
                close,
            } => (RpcKind::Write, *offset, data.len() as u32, *close),
            Op::Free => (RpcKind::Free, 0, 0, false),
        };
        self.requests.push(RequestRecord {
            rpc,
            kind,
            backup,
            master,
            segment,
            offset,
            len,
            close,
        });

        let injected = self.draw_failure(backup);
        self.in_flight.insert(
            rpc,
            InFlight {
                backup,
                master,
                segment,
                op,
                polls_left: self.latency_polls,
                injected,
            },
        );
        rpc
    }

    fn draw_failure(&mut self, backup: ServerId) -> Option<RpcError> {
        if let Some(remaining) = self.fail_next.get_mut(&backup) {
            if *remaining > 0 {
                *remaining -= 1;
                return Some(RpcError::Unreachable(backup));
            }
        }
        if let Some(remaining) = self.reject_next.get_mut(&backup) {
            if *remaining > 0 {
                *remaining -= 1;
                return Some(RpcError::Rejected {
                    backup,
                    reason: "injected rejection".to_string(),
                });
            }
        }
        let rate = self.failure_rate;
        match self.rng.as_mut() {
            Some(rng) if rate > 0.0 => rng.gen_bool(rate).then(|| RpcError::Unreachable(backup)),
            _ => None,
        }
    }

    fn poll(&mut self, rpc: RpcId) -> RpcStatus {
        let request = match self.in_flight.get_mut(&rpc) {
            Some(request) => request,
            None => return RpcStatus::Failed(RpcError::UnknownRpc(rpc)),
        };

        let alive = self
            .backups
            .get(&request.backup)
            .map(|b| b.alive)
            .unwrap_or(false);
        if alive {
            if self.paused {
                return RpcStatus::Pending;
            }
            if request.polls_left > 0 {
                request.polls_left -= 1;
                return RpcStatus::Pending;
            }
        }

        let request = match self.in_flight.remove(&rpc) {
            Some(request) => request,
            None => return RpcStatus::Failed(RpcError::UnknownRpc(rpc)),
        };
        if !alive {
            return RpcStatus::Failed(RpcError::Unreachable(request.backup));
        }
        if let Some(err) = request.injected {
            return RpcStatus::Failed(err);
        }
        self.apply(request)
    }

    fn apply(&mut self, request: InFlight) -> RpcStatus {
        let backup = request.backup;
        let node = match self.backups.get_mut(&backup) {
            Some(node) => node,
            None => return RpcStatus::Failed(RpcError::Unreachable(backup)),
        };
        let key = (request.master, request.segment);

        match request.op {
            Op::Open { data, close } => {
                node.replicas.insert(
                    key,
                    StoredReplica {
                        data: data.to_vec(),
                        closed: close,
                    },
                );
            }
            Op::Write {
                offset,
                data,
                close,
            } => {
                let replica = match node.replicas.get_mut(&key) {
                    Some(replica) => replica,
                    None => {
                        return RpcStatus::Failed(RpcError::Rejected {
                            backup,
                            reason: "write to a replica that was never opened".to_string(),
                        })
                    }
                };
                if replica.closed {
                    return RpcStatus::Failed(RpcError::Rejected {
                        backup,
                        reason: "write to a closed replica".to_string(),
                    });
                }
                if offset as usize != replica.data.len() {
                    return RpcStatus::Failed(RpcError::Rejected {
                        backup,
                        reason: format!(
                            "write at offset {} but replica holds {} bytes",
                            offset,
                            replica.data.len()
                        ),
                    });
                }
                replica.data.extend_from_slice(&data);
                replica.closed = close;
            }
            Op::Free => {
                node.replicas.remove(&key);
            }
        }
        RpcStatus::Completed
    }
}

/// Simulated set of backup servers; clones share state
#[derive(Debug, Clone, Default)]
pub struct SimulatedCluster {
    state: Rc<RefCell<ClusterState>>,
}

impl SimulatedCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cluster with live backups `server.1` through `server.n`
    pub fn with_backups(n: u64) -> Self {
        let cluster = Self::new();
        for id in 1..=n {
            cluster.add_backup(ServerId(id));
        }
        cluster
    }

    /// Fail requests at random with probability `rate`, reproducibly.
    pub fn with_failure_rate(self, rate: f64, seed: u64) -> Self {
        {
            let mut state = self.state.borrow_mut();
            state.failure_rate = rate.clamp(0.0, 1.0);
            state.rng = Some(StdRng::seed_from_u64(seed));
        }
        self
    }

    /// Coordinator view backed by this cluster
    pub fn membership(&self) -> Box<dyn ClusterMembership> {
        Box::new(self.clone())
    }

    /// Transport backed by this cluster
    pub fn transport(&self) -> Box<dyn BackupTransport> {
        Box::new(self.clone())
    }

    /// Add a live backup with no replicas. Ids are never reused: adding
    /// an id the cluster already knows changes nothing.
    pub fn add_backup(&self, backup: ServerId) {
        self.state
            .borrow_mut()
            .backups
            .entry(backup)
            .or_insert_with(|| BackupNode {
                alive: true,
                replicas: HashMap::new(),
            });
    }

    /// Crash a backup: it leaves the membership, its in-flight requests
    /// fail and its stored replicas are lost.
    pub fn kill(&self, backup: ServerId) {
        let mut state = self.state.borrow_mut();
        if let Some(node) = state.backups.get_mut(&backup) {
            node.alive = false;
            node.replicas.clear();
        }
    }

    /// Restart a backup. It loses its replicas and rejoins empty under a
    /// fresh id, the way a coordinator enlists a restarted server; the old
    /// id stays dead.
    pub fn revive(&self, backup: ServerId) -> ServerId {
        self.kill(backup);
        let fresh = {
            let state = self.state.borrow();
            let last = state.backups.keys().next_back().map_or(0, |id| id.get());
            ServerId(last + 1)
        };
        self.add_backup(fresh);
        fresh
    }

    /// Number of polls a request stays pending before completing
    pub fn set_latency(&self, polls: u32) {
        self.state.borrow_mut().latency_polls = polls;
    }

    /// Hold every request on a live backup in the pending state
    pub fn pause(&self) {
        self.state.borrow_mut().paused = true;
    }

    pub fn resume(&self) {
        self.state.borrow_mut().paused = false;
    }

    /// Make the next `n` requests issued to `backup` fail as unreachable.
    pub fn fail_next(&self, backup: ServerId, n: u32) {
        *self.state.borrow_mut().fail_next.entry(backup).or_insert(0) += n;
    }

    /// Make the next `n` requests issued to `backup` come back rejected.
    pub fn reject_next(&self, backup: ServerId, n: u32) {
        *self.state.borrow_mut().reject_next.entry(backup).or_insert(0) += n;
    }

    /// Every request issued so far, in issue order
    pub fn requests(&self) -> Vec<RequestRecord> {
        self.state.borrow().requests.clone()
    }

    /// Requests issued but not yet reported terminal
    pub fn pending_rpcs(&self) -> usize {
        self.state.borrow().in_flight.len()
    }

    /// Bytes a backup stores for a segment
    pub fn replica(&self, backup: ServerId, master: ServerId, segment: SegmentId) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        state
            .backups
            .get(&backup)
            .and_then(|node| node.replicas.get(&(master, segment)))
            .map(|replica| replica.data.clone())
    }

    /// CRC32 of the bytes a backup stores for a segment
    pub fn replica_checksum(
        &self,
        backup: ServerId,
        master: ServerId,
        segment: SegmentId,
    ) -> Option<u32> {
        self.replica(backup, master, segment)
            .map(|data| crc32fast::hash(&data))
    }

    /// True if the backup's replica received the close flag
    pub fn is_closed(&self, backup: ServerId, master: ServerId, segment: SegmentId) -> bool {
        let state = self.state.borrow();
        state
            .backups
            .get(&backup)
            .and_then(|node| node.replicas.get(&(master, segment)))
            .map(|replica| replica.closed)
            .unwrap_or(false)
    }

    /// Live backups holding a replica of the segment
    pub fn holders(&self, master: ServerId, segment: SegmentId) -> Vec<ServerId> {
        let state = self.state.borrow();
        state
            .backups
            .iter()
            .filter(|(_, node)| node.alive && node.replicas.contains_key(&(master, segment)))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Replicas stored on one backup
    pub fn stored_replicas(&self, backup: ServerId) -> usize {
        let state = self.state.borrow();
        state
            .backups
            .get(&backup)
            .map(|node| node.replicas.len())
            .unwrap_or(0)
    }
}

impl ClusterMembership for SimulatedCluster {
    fn live_backups(&self) -> Vec<ServerId> {
        let state = self.state.borrow();
        state
            .backups
            .iter()
            .filter(|(_, node)| node.alive)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl BackupTransport for SimulatedCluster {
    fn open_and_write(
        &mut self,
        backup: ServerId,
        master: ServerId,
        segment: SegmentId,
        data: Bytes,
        close: bool,
    ) -> RpcId {
        self.state
            .borrow_mut()
            .issue(backup, master, segment, Op::Open { data, close })
    }

    fn write(
        &mut self,
        backup: ServerId,
        master: ServerId,
        segment: SegmentId,
        offset: u32,
        data: Bytes,
        close: bool,
    ) -> RpcId {
        self.state.borrow_mut().issue(
            backup,
            master,
            segment,
            Op::Write {
                offset,
                data,
                close,
            },
        )
    }

    fn free_segment(&mut self, backup: ServerId, master: ServerId, segment: SegmentId) -> RpcId {
        self.state
            .borrow_mut()
            .issue(backup, master, segment, Op::Free)
    }

    fn poll(&mut self, rpc: RpcId) -> RpcStatus {
        self.state.borrow_mut().poll(rpc)
    }
}
