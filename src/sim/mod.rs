//! Simulated backup cluster
//!
//! An in-process stand-in for the coordinator and the backup servers, used
//! by tests and by the `segrep simulate` driver. Single-threaded; clones
//! share one cluster.

mod cluster;

pub use cluster::{RequestRecord, SimulatedCluster};
