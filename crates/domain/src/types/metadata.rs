//! Per user/device sync metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default interval between scheduled drains.
pub const DEFAULT_SYNC_FREQUENCY_SECS: u64 = 300;

/// User-controlled sync preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncPreferences {
    pub auto_sync: bool,
    pub sync_on_metered_connection: bool,
    /// Attempts an item gets before it is dead-lettered.
    pub max_retries: u32,
}

impl Default for SyncPreferences {
    fn default() -> Self {
        Self { auto_sync: true, sync_on_metered_connection: false, max_retries: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub platform: Option<String>,
    pub browser: Option<String>,
    pub last_active: DateTime<Utc>,
}

/// One record per `(user_id, device_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub user_id: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Only advanced by runs that left nothing pending or failed.
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub sync_frequency_secs: u64,
    pub sync_preferences: SyncPreferences,
    pub device_info: DeviceInfo,
}

impl SyncMetadata {
    /// Fresh metadata for a device that has never synced.
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            last_sync_at: None,
            last_successful_sync_at: None,
            sync_frequency_secs: DEFAULT_SYNC_FREQUENCY_SECS,
            sync_preferences: SyncPreferences::default(),
            device_info: DeviceInfo {
                device_id: device_id.into(),
                platform: None,
                browser: None,
                last_active: now,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferences_fill_missing_fields_with_defaults() {
        let prefs: SyncPreferences = serde_json::from_str(r#"{"autoSync": false}"#).unwrap();
        assert!(!prefs.auto_sync);
        assert_eq!(prefs.max_retries, 3);
        assert!(!prefs.sync_on_metered_connection);
    }
}
