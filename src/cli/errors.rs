//! CLI-specific error types
//!
//! Every CLI error ends the process with exit code 1.

use std::fmt;
use std::io;

use crate::replication::{ReplicationError, ReplicationErrorKind};

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file or argument error
    ConfigError,
    /// I/O error (stdout)
    IoError,
    /// Replication core refused an operation
    ReplicationFailed,
    /// Replicas did not match the data that was written
    VerificationFailed,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "SEGREP_CLI_CONFIG_ERROR",
            Self::IoError => "SEGREP_CLI_IO_ERROR",
            Self::ReplicationFailed => "SEGREP_CLI_REPLICATION_FAILED",
            Self::VerificationFailed => "SEGREP_CLI_VERIFICATION_FAILED",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    /// Create a new CLI error
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Config error
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    /// I/O error
    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    /// Replication error
    pub fn replication_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ReplicationFailed, msg)
    }

    /// Verification error
    pub fn verification_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::VerificationFailed, msg)
    }

    /// Get the error code
    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    /// Get the error code string
    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<ReplicationError> for CliError {
    fn from(e: ReplicationError) -> Self {
        match e.kind {
            ReplicationErrorKind::ConfigurationError => Self::config_error(e.message),
            _ => Self::replication_failed(e.to_string()),
        }
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;
