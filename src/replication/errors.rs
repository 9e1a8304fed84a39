//! Replication Error Types
//!
//! - Backup-level failures never surface here; they are retried internally
//! - Pool exhaustion is fatal
//! - Caller contract violations are explicit errors

use std::fmt;

/// Replication error type
#[derive(Debug, Clone)]
pub struct ReplicationError {
    /// Error kind
    pub kind: ReplicationErrorKind,
    /// Error message
    pub message: String,
}

/// Replication error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationErrorKind {
    /// Backup selector found no eligible backup
    NoBackupsAvailable,

    /// Segment pool has no free entries (leak)
    PoolExhausted,

    /// A segment with this id is already open for this master
    DuplicateSegment,

    /// No tracked segment with this id
    UnknownSegment,

    /// Handle refers to a segment that was already reclaimed
    StaleHandle,

    /// Queued data would shrink, or segment no longer accepts data
    InvalidWrite,

    /// Open payload exceeds the atomic request size
    PayloadTooLarge,

    /// Configuration error
    ConfigurationError,
}

impl ReplicationError {
    /// Create a new replication error.
    pub fn new(kind: ReplicationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create a no-backups-available error.
    pub fn no_backups_available(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::NoBackupsAvailable, message)
    }

    /// Create a pool exhausted error.
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::PoolExhausted, message)
    }

    /// Create a duplicate segment error.
    pub fn duplicate_segment(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::DuplicateSegment, message)
    }

    /// Create an unknown segment error.
    pub fn unknown_segment(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::UnknownSegment, message)
    }

    /// Create a stale handle error.
    pub fn stale_handle(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::StaleHandle, message)
    }

    /// Create an invalid write error.
    pub fn invalid_write(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::InvalidWrite, message)
    }

    /// Create a payload too large error.
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::PayloadTooLarge, message)
    }

    /// Create a configuration error.
    pub fn configuration_error(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::ConfigurationError, message)
    }

    /// Check if this error is fatal (the caller must halt).
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ReplicationErrorKind::PoolExhausted)
    }

    /// Check if this error is a caller contract violation.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self.kind,
            ReplicationErrorKind::DuplicateSegment
                | ReplicationErrorKind::UnknownSegment
                | ReplicationErrorKind::StaleHandle
                | ReplicationErrorKind::InvalidWrite
                | ReplicationErrorKind::PayloadTooLarge
        )
    }
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicationError({:?}): {}", self.kind, self.message)
    }
}

impl std::error::Error for ReplicationError {}

/// Result type for replication operations
pub type ReplicationResult<T> = Result<T, ReplicationError>;
