//! Mapping of SQLite, pool, HTTP and join failures onto [`TillSyncError`].
//!
//! Repositories rely on two distinctions: a duplicate `client_id` or a write
//! refused by the ledger's constraints is a `Conflict`, and a value rejected
//! by a CHECK constraint is `InvalidInput`. Everything else from storage is a
//! `Database` error.

use r2d2::Error as PoolError;
use reqwest::Error as HttpError;
use rusqlite::ffi;
use rusqlite::Error as SqlError;
use tillsync_domain::TillSyncError;
use tokio::task::JoinError;

/// Newtype so the foreign-error conversions live on the infrastructure side.
#[derive(Debug)]
pub struct InfraError(pub TillSyncError);

impl From<InfraError> for TillSyncError {
    fn from(value: InfraError) -> Self {
        value.0
    }
}

impl From<SqlError> for InfraError {
    fn from(value: SqlError) -> Self {
        let SqlError::SqliteFailure(failure, message) = &value else {
            return Self(TillSyncError::Database(value.to_string()));
        };
        let message = message.clone().unwrap_or_else(|| failure.to_string());
        Self(match failure.extended_code {
            ffi::SQLITE_CONSTRAINT_PRIMARYKEY | ffi::SQLITE_CONSTRAINT_UNIQUE => {
                TillSyncError::Conflict(format!("duplicate row: {message}"))
            }
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY | ffi::SQLITE_CONSTRAINT_TRIGGER => {
                TillSyncError::Conflict(format!("write refused: {message}"))
            }
            ffi::SQLITE_CONSTRAINT_CHECK => TillSyncError::InvalidInput(message),
            _ => TillSyncError::Database(message),
        })
    }
}

impl From<PoolError> for InfraError {
    fn from(value: PoolError) -> Self {
        Self(TillSyncError::Database(format!("no sqlite connection available: {value}")))
    }
}

/// System-of-record reads and writes. Queue replays classify statuses
/// themselves and never come through here.
impl From<HttpError> for InfraError {
    fn from(value: HttpError) -> Self {
        let error = match value.status() {
            Some(status) if status.as_u16() == 404 => TillSyncError::NotFound(value.to_string()),
            Some(status) if status.as_u16() == 409 => TillSyncError::Conflict(value.to_string()),
            Some(status) if status.is_client_error() => {
                TillSyncError::InvalidInput(value.to_string())
            }
            _ if value.is_decode() => {
                TillSyncError::InvalidInput(format!("malformed record body: {value}"))
            }
            _ => TillSyncError::Network(value.to_string()),
        };
        Self(error)
    }
}

/// `spawn_blocking` join failures as domain errors.
pub fn map_join_error(err: JoinError) -> TillSyncError {
    TillSyncError::Internal(format!("blocking database task failed: {err}"))
}
