//! segrep - non-blocking segment replication for an in-memory storage master
//!
//! A master's append-only log segments are copied onto a configurable
//! number of backups. Progress is cooperative: nothing happens outside
//! `BackupManager::proceed` and `BackupManager::sync`.

pub mod cli;
pub mod observability;
pub mod replication;
pub mod scheduler;
pub mod sim;
