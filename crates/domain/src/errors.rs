//! Error types used throughout the engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for TillSync
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum TillSyncError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A compare-and-swap write lost against a concurrent writer, or a record
    /// is not in the state the caller expected. Reload and retry.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TillSyncError {
    /// Stable label suitable for log fields and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::Config(_) => "config",
            Self::Network(_) => "network",
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal",
        }
    }

    /// Returns true for optimistic-concurrency and state-mismatch failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Result type alias for TillSync operations
pub type Result<T> = std::result::Result<T, TillSyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let err = TillSyncError::Conflict("version advanced".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "Conflict");
        assert_eq!(json["message"], "version advanced");
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(TillSyncError::NotFound("x".into()).label(), "not_found");
        assert!(TillSyncError::Conflict("x".into()).is_conflict());
        assert!(!TillSyncError::Database("x".into()).is_conflict());
    }
}
