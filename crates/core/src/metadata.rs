//! Metadata Store service
//!
//! Owns the per user/device [`SyncMetadata`] record: last sync timestamps,
//! device identity and the preferences the engine consults before draining.

use std::sync::Arc;
use std::time::Duration;

use tillsync_domain::{IdentityContext, NetworkInfo, Result, SyncMetadata, SyncPreferences};
use tracing::debug;

use crate::sync::ports::MetadataRepository;
use crate::time::Clock;

#[derive(Clone)]
pub struct MetadataStore {
    repo: Arc<dyn MetadataRepository>,
    identity: IdentityContext,
    clock: Arc<dyn Clock>,
    default_max_retries: u32,
}

impl MetadataStore {
    pub fn new(
        repo: Arc<dyn MetadataRepository>,
        identity: IdentityContext,
        clock: Arc<dyn Clock>,
        default_max_retries: u32,
    ) -> Self {
        Self { repo, identity, clock, default_max_retries }
    }

    /// Stored metadata, or defaults for a device that has never synced.
    pub async fn load(&self) -> Result<SyncMetadata> {
        let stored = self.repo.load(&self.identity.user_id, &self.identity.device_id).await?;
        Ok(stored.unwrap_or_else(|| {
            let mut fresh = SyncMetadata::new(
                self.identity.user_id.clone(),
                self.identity.device_id.clone(),
                self.clock.now(),
            );
            fresh.sync_preferences.max_retries = self.default_max_retries;
            fresh
        }))
    }

    pub async fn max_retries(&self) -> Result<u32> {
        Ok(self.load().await?.sync_preferences.max_retries)
    }

    pub async fn sync_frequency(&self) -> Result<Duration> {
        Ok(Duration::from_secs(self.load().await?.sync_frequency_secs.max(1)))
    }

    /// Stamp a finished run. `last_successful_sync_at` only moves when the
    /// run left nothing pending or failed.
    pub async fn record_sync_attempt(&self, fully_synced: bool) -> Result<SyncMetadata> {
        let now = self.clock.now();
        let mut metadata = self.load().await?;
        metadata.last_sync_at = Some(now);
        if fully_synced {
            metadata.last_successful_sync_at = Some(now);
        }
        metadata.device_info.last_active = now;
        self.repo.save(&metadata).await?;

        debug!(fully_synced, "sync metadata recorded");
        Ok(metadata)
    }

    /// Whether an automatic (reconnect or scheduled) drain may start.
    pub async fn should_auto_sync(&self, network: &NetworkInfo) -> Result<bool> {
        if !network.online {
            return Ok(false);
        }
        let prefs = self.load().await?.sync_preferences;
        Ok(prefs.auto_sync && (!network.metered || prefs.sync_on_metered_connection))
    }

    pub async fn update_preferences(&self, preferences: SyncPreferences) -> Result<SyncMetadata> {
        let mut metadata = self.load().await?;
        metadata.sync_preferences = preferences;
        self.repo.save(&metadata).await?;
        Ok(metadata)
    }

    pub async fn set_sync_frequency(&self, frequency: Duration) -> Result<SyncMetadata> {
        let mut metadata = self.load().await?;
        metadata.sync_frequency_secs = frequency.as_secs().max(1);
        self.repo.save(&metadata).await?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryMetadata;
    use crate::time::MockClock;

    fn store(clock: &MockClock) -> (MetadataStore, Arc<InMemoryMetadata>) {
        let repo = Arc::new(InMemoryMetadata::new());
        let store = MetadataStore::new(
            repo.clone(),
            IdentityContext::new("u-1", "s-1", "d-1"),
            Arc::new(clock.clone()),
            5,
        );
        (store, repo)
    }

    #[tokio::test]
    async fn defaults_apply_until_saved() {
        let clock = MockClock::new();
        let (store, _) = store(&clock);
        let metadata = store.load().await.unwrap();
        assert_eq!(metadata.sync_preferences.max_retries, 5);
        assert!(metadata.last_sync_at.is_none());
    }

    #[tokio::test]
    async fn successful_timestamp_only_moves_on_full_sync() {
        let clock = MockClock::new();
        let (store, _) = store(&clock);

        let first = store.record_sync_attempt(true).await.unwrap();
        assert_eq!(first.last_successful_sync_at, Some(clock.now()));

        clock.advance(Duration::from_secs(60));
        let second = store.record_sync_attempt(false).await.unwrap();
        assert_eq!(second.last_sync_at, Some(clock.now()));
        assert_eq!(second.last_successful_sync_at, first.last_successful_sync_at);
    }

    #[tokio::test]
    async fn auto_sync_honours_preferences() {
        let clock = MockClock::new();
        let (store, _) = store(&clock);
        let metered = NetworkInfo { online: true, metered: true, connection_type: Some("cellular".into()) };

        assert!(store.should_auto_sync(&NetworkInfo::online()).await.unwrap());
        assert!(!store.should_auto_sync(&metered).await.unwrap());
        assert!(!store.should_auto_sync(&NetworkInfo::offline()).await.unwrap());

        store
            .update_preferences(SyncPreferences { sync_on_metered_connection: true, ..Default::default() })
            .await
            .unwrap();
        assert!(store.should_auto_sync(&metered).await.unwrap());

        store
            .update_preferences(SyncPreferences { auto_sync: false, ..Default::default() })
            .await
            .unwrap();
        assert!(!store.should_auto_sync(&NetworkInfo::online()).await.unwrap());
    }
}
