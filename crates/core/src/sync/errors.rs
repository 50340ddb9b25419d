//! Sync-specific error types
//!
//! Provides error classification for remote replay with retry metadata.

use std::time::Duration;

use thiserror::Error;
use tillsync_domain::TillSyncError;

/// Longest `error_detail` persisted on a queue item.
pub const MAX_ERROR_DETAIL_LEN: usize = 256;

/// Categories of sync errors for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Connection refused, reset, DNS
    Network,
    /// Remote call exceeded its deadline
    Timeout,
    /// 429
    RateLimit,
    /// 5xx
    Server,
    /// 401/403, typically fixed by a token refresh on the host side
    Auth,
    /// Remote rejected the payload as invalid
    Validation,
    /// Remote value diverged from what the mutation expected
    Conflict,
    /// Attempt abandoned because the drain was cancelled
    Cancelled,
    /// Local persistence failed
    Storage,
}

/// How the engine reacts to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Back off and try again until `max_retries` is reached.
    Retryable,
    /// Dead-letter immediately.
    Permanent,
    /// Dead-letter with a conflict detail; never retried automatically.
    Conflict,
}

/// Remote replay errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// Get the error category for this error
    pub const fn category(&self) -> SyncErrorCategory {
        match self {
            Self::Network(_) => SyncErrorCategory::Network,
            Self::Timeout(_) => SyncErrorCategory::Timeout,
            Self::RateLimit(_) => SyncErrorCategory::RateLimit,
            Self::Server(_) => SyncErrorCategory::Server,
            Self::Auth(_) => SyncErrorCategory::Auth,
            Self::Validation(_) => SyncErrorCategory::Validation,
            Self::Conflict(_) => SyncErrorCategory::Conflict,
            Self::Cancelled => SyncErrorCategory::Cancelled,
            Self::Storage(_) => SyncErrorCategory::Storage,
        }
    }

    pub const fn disposition(&self) -> ErrorDisposition {
        match self.category() {
            SyncErrorCategory::Network
            | SyncErrorCategory::Timeout
            | SyncErrorCategory::RateLimit
            | SyncErrorCategory::Server
            | SyncErrorCategory::Auth
            | SyncErrorCategory::Cancelled
            | SyncErrorCategory::Storage => ErrorDisposition::Retryable,
            SyncErrorCategory::Validation => ErrorDisposition::Permanent,
            SyncErrorCategory::Conflict => ErrorDisposition::Conflict,
        }
    }

    /// Check if this error should be retried
    pub const fn should_retry(&self) -> bool {
        matches!(self.disposition(), ErrorDisposition::Retryable)
    }

    /// Human-readable detail stored on the queue item.
    pub fn detail(&self) -> String {
        let detail = match self {
            Self::Conflict(message) => format!("conflict: {message}"),
            other => other.to_string(),
        };
        truncate_detail(&detail)
    }
}

/// Convert from TillSyncError to SyncError
impl From<TillSyncError> for SyncError {
    fn from(err: TillSyncError) -> Self {
        match err {
            TillSyncError::Network(message) => Self::Network(message),
            TillSyncError::Conflict(message) => Self::Conflict(message),
            TillSyncError::InvalidInput(message) | TillSyncError::NotFound(message) => {
                Self::Validation(message)
            }
            TillSyncError::Database(message) => Self::Storage(message),
            TillSyncError::Config(message) | TillSyncError::Internal(message) => {
                Self::Server(message)
            }
        }
    }
}

/// Cut `detail` to [`MAX_ERROR_DETAIL_LEN`] characters on a char boundary.
pub fn truncate_detail(detail: &str) -> String {
    match detail.char_indices().nth(MAX_ERROR_DETAIL_LEN) {
        Some((end, _)) => detail[..end].to_string(),
        None => detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispositions() {
        assert_eq!(SyncError::Network("x".into()).disposition(), ErrorDisposition::Retryable);
        assert_eq!(
            SyncError::Timeout(Duration::from_secs(1)).disposition(),
            ErrorDisposition::Retryable
        );
        assert_eq!(SyncError::Auth("x".into()).disposition(), ErrorDisposition::Retryable);
        assert_eq!(SyncError::Validation("x".into()).disposition(), ErrorDisposition::Permanent);
        assert_eq!(SyncError::Conflict("x".into()).disposition(), ErrorDisposition::Conflict);
    }

    #[test]
    fn test_should_retry() {
        assert!(SyncError::RateLimit("x".into()).should_retry());
        assert!(SyncError::Server("x".into()).should_retry());
        assert!(!SyncError::Validation("x".into()).should_retry());
        assert!(!SyncError::Conflict("x".into()).should_retry());
    }

    #[test]
    fn test_conflict_detail_is_prefixed() {
        assert_eq!(SyncError::Conflict("version 4 != 3".into()).detail(), "conflict: version 4 != 3");
    }

    #[test]
    fn test_detail_truncation_respects_char_boundaries() {
        let long = "é".repeat(300);
        let truncated = truncate_detail(&long);
        assert_eq!(truncated.chars().count(), MAX_ERROR_DETAIL_LEN);
        assert_eq!(truncate_detail("short"), "short");
    }

    #[test]
    fn test_domain_error_conversion() {
        let err: SyncError = TillSyncError::InvalidInput("bad sku".into()).into();
        assert_eq!(err.category(), SyncErrorCategory::Validation);
        let err: SyncError = TillSyncError::Database("locked".into()).into();
        assert!(err.should_retry());
    }
}
