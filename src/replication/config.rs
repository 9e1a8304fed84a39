//! Replication Configuration
//!
//! Configured externally (JSON file or constructor), immutable once a
//! manager is built from it.
//!
//! Format:
//! ```json
//! {
//!   "num_replicas": 3,
//!   "pool_capacity": 1024,
//!   "max_rpc_bytes": 1048576
//! }
//! ```
//! Every field is optional and falls back to its default.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::errors::{ReplicationError, ReplicationResult};

/// Upper bound on replicas per segment.
pub const MAX_REPLICAS: u32 = 64;

fn default_num_replicas() -> u32 {
    3
}
fn default_pool_capacity() -> usize {
    1024
}
fn default_max_rpc_bytes() -> u32 {
    1 << 20
} // 1 MiB

/// Replication configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Number of replicas to keep of each segment.
    #[serde(default = "default_num_replicas")]
    pub num_replicas: u32,

    /// Maximum number of segments tracked at once.
    ///
    /// Running out of pool entries means segments are not being freed.
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    /// Maximum payload carried by one open or write request.
    ///
    /// The initial bytes handed to `open_segment` must fit in one request.
    #[serde(default = "default_max_rpc_bytes")]
    pub max_rpc_bytes: u32,
}

impl ReplicationConfig {
    /// Create a configuration with the given replica count and defaults
    /// for everything else.
    pub fn with_replicas(num_replicas: u32) -> Self {
        Self {
            num_replicas,
            ..Self::default()
        }
    }

    /// Builder-style override of the pool capacity.
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Builder-style override of the request payload limit.
    pub fn max_rpc_bytes(mut self, bytes: u32) -> Self {
        self.max_rpc_bytes = bytes;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.num_replicas > MAX_REPLICAS {
            return Err(ReplicationError::configuration_error(format!(
                "num_replicas must be <= {}, got {}",
                MAX_REPLICAS, self.num_replicas
            )));
        }
        if self.pool_capacity == 0 {
            return Err(ReplicationError::configuration_error(
                "pool_capacity must be > 0",
            ));
        }
        if self.pool_capacity > u32::MAX as usize {
            return Err(ReplicationError::configuration_error(
                "pool_capacity must fit in 32 bits",
            ));
        }
        if self.max_rpc_bytes == 0 {
            return Err(ReplicationError::configuration_error(
                "max_rpc_bytes must be > 0",
            ));
        }
        Ok(())
    }

    /// Parse and validate a configuration from JSON.
    pub fn from_json(json: &str) -> ReplicationResult<Self> {
        let config: ReplicationConfig = serde_json::from_str(json).map_err(|e| {
            ReplicationError::configuration_error(format!("Invalid config JSON: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> ReplicationResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            ReplicationError::configuration_error(format!("Failed to serialize config: {}", e))
        })
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> ReplicationResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ReplicationError::configuration_error(format!(
                "Failed to read config {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            num_replicas: default_num_replicas(),
            pool_capacity: default_pool_capacity(),
            max_rpc_bytes: default_max_rpc_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = ReplicationConfig::default();
        assert_eq!(config.num_replicas, 3);
        assert_eq!(config.pool_capacity, 1024);
        assert_eq!(config.max_rpc_bytes, 1 << 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_replicas_is_valid() {
        assert!(ReplicationConfig::with_replicas(0).validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_pool() {
        let config = ReplicationConfig::default().pool_capacity(0);
        let err = config.validate().unwrap_err();
        assert!(err.message.contains("pool_capacity"));
    }

    #[test]
    fn test_rejects_zero_rpc_bytes() {
        let config = ReplicationConfig::default().max_rpc_bytes(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_too_many_replicas() {
        let config = ReplicationConfig::with_replicas(MAX_REPLICAS + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = ReplicationConfig::from_json(r#"{"num_replicas": 2}"#).unwrap();
        assert_eq!(config.num_replicas, 2);
        assert_eq!(config.pool_capacity, 1024);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = ReplicationConfig::from_json("{not json").unwrap_err();
        assert!(err.message.contains("Invalid config JSON"));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = ReplicationConfig::with_replicas(5).max_rpc_bytes(4096);
        let json = config.to_json().unwrap();
        assert_eq!(ReplicationConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"num_replicas": 1, "pool_capacity": 8}}"#).unwrap();

        let config = ReplicationConfig::load(file.path()).unwrap();
        assert_eq!(config.num_replicas, 1);
        assert_eq!(config.pool_capacity, 8);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = ReplicationConfig::load(&dir.path().join("missing.json"));
        assert!(result.is_err());
    }
}
