//! Server and segment identities

use std::fmt;

use serde::{Deserialize, Serialize};

/// Caller-assigned segment identifier, unique per master while open
pub type SegmentId = u64;

/// Identity of a master or backup server
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub u64);

impl ServerId {
    /// Raw numeric id
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ServerId {
    fn from(id: u64) -> Self {
        ServerId(id)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server.{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ServerId(7).to_string(), "server.7");
    }

    #[test]
    fn test_serde_is_transparent() {
        let json = serde_json::to_string(&ServerId(42)).unwrap();
        assert_eq!(json, "42");
        let back: ServerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ServerId(42));
    }
}
