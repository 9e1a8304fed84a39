//! Segment Replication
//!
//! Copies a master's append-only log segments onto a configurable number
//! of backups without ever blocking the log-writing thread on I/O.
//!
//! - No data is durable until every replica acknowledged it
//! - Backup failures are retried internally and never reach the caller
//! - Segment state lives in a fixed-capacity pool addressed by handles
//! - All progress happens inside `proceed` and `sync`
//!
//! # Usage
//!
//! ```ignore
//! let mut manager = BackupManager::new(coordinator, transport, master, config)?;
//! let handle = manager.open_segment(5, segment_bytes)?;
//! manager.sync();
//! assert!(manager.is_synced(handle));
//! manager.free(handle)?;
//! ```

mod config;
mod errors;
mod identity;
mod manager;
mod pool;
mod segment;
mod selector;
mod transport;

pub use config::{ReplicationConfig, MAX_REPLICAS};
pub use errors::{ReplicationError, ReplicationErrorKind, ReplicationResult};
pub use identity::{SegmentId, ServerId};
pub use manager::BackupManager;
pub use pool::{SegmentHandle, SegmentPool};
pub use segment::{ReplicaPhase, ReplicatedSegment, SegmentPhase};
pub use selector::BackupSelector;
pub use transport::{BackupTransport, ClusterMembership, RpcError, RpcId, RpcStatus};
