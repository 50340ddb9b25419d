//! Authenticated identity context

use serde::{Deserialize, Serialize};

/// Who is replaying the queue, and for which store.
///
/// Supplied by the host's session layer; the engine only forwards it to the
/// remote boundary and stamps it on metadata and audit rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityContext {
    pub user_id: String,
    pub store_id: String,
    pub device_id: String,
}

impl IdentityContext {
    pub fn new(
        user_id: impl Into<String>,
        store_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self { user_id: user_id.into(), store_id: store_id.into(), device_id: device_id.into() }
    }
}
