//! Column codecs shared by the repositories
//!
//! Timestamps are stored as UTC epoch milliseconds, JSON documents as TEXT
//! and status enums as their lowercase string form.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tillsync_domain::{Result, TillSyncError};

use crate::errors::InfraError;

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn opt_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(to_millis)
}

pub(crate) fn get_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        conversion_error(idx, Type::Integer, format!("timestamp out of range: {millis}"))
    })
}

pub(crate) fn get_opt_timestamp(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        None => Ok(None),
        Some(_) => get_timestamp(row, idx).map(Some),
    }
}

/// Parse a status column with the enum's `FromStr`.
pub(crate) fn get_enum<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = TillSyncError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: TillSyncError| conversion_error(idx, Type::Text, e.to_string()))
}

pub(crate) fn get_opt_enum<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = TillSyncError>,
{
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => get_enum(row, idx).map(Some),
    }
}

pub(crate) fn get_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, Type::Text, e.to_string()))
}

pub(crate) fn get_opt_json<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => get_json(row, idx).map(Some),
    }
}

pub(crate) fn get_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value)
        .map_err(|_| conversion_error(idx, Type::Integer, format!("negative value: {value}")))
}

pub(crate) fn to_json_text<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| TillSyncError::Internal(format!("failed to encode JSON column: {e}")))
}

pub(crate) fn opt_json_text<T: Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value.map(to_json_text).transpose()
}

pub(crate) fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn usize_to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn map_sql_error(err: rusqlite::Error) -> TillSyncError {
    TillSyncError::from(InfraError::from(err))
}

fn conversion_error(idx: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, message.into())
}
