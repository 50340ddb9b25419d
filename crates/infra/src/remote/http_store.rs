//! REST client for the remote system of record
//!
//! Records are addressed as `{base_url}/{entity}/{record_key}`:
//! - create/update: `PUT` with the payload as JSON body
//! - delete: `DELETE`
//! - reconciliation lookups: `GET`, where `404` means the record is absent
//!
//! Every write carries `Idempotency-Key: {client_id}` so a replayed queue
//! item is a no-op remotely. The remote flags such replays with the
//! [`REPLAY_HEADER`] response header.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use tillsync_core::{RemoteAck, RemoteStore, RemoteWrite, SyncError, SystemOfRecord};
use tillsync_domain::{
    IdentityContext, QueueOperation, RemoteConfig, Result, SyncConfig, TillSyncError,
};
use tracing::{debug, instrument, warn};

use crate::errors::InfraError;

/// Response header the remote sets to `true` when the idempotency key was
/// already applied.
pub const REPLAY_HEADER: &str = "Idempotent-Replayed";

/// Configuration for [`HttpRemoteStore`]
#[derive(Debug, Clone)]
pub struct RemoteClientConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    /// Deadline for one request, including reading the body.
    pub timeout: Duration,
}

impl RemoteClientConfig {
    pub fn from_config(remote: &RemoteConfig, sync: &SyncConfig) -> Self {
        Self {
            base_url: remote.base_url.clone(),
            api_token: remote.api_token.clone(),
            timeout: Duration::from_millis(sync.remote_timeout_ms),
        }
    }
}

/// reqwest-backed remote store and system of record
#[derive(Clone)]
pub struct HttpRemoteStore {
    client: Client,
    base_url: Url,
    api_token: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for HttpRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteStore")
            .field("base_url", &self.base_url.as_str())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpRemoteStore {
    /// # Errors
    /// Returns `TillSyncError::Config` if the base URL is not an absolute
    /// http(s) URL or the client cannot be built.
    pub fn new(config: RemoteClientConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            TillSyncError::Config(format!("Invalid remote base URL '{}': {e}", config.base_url))
        })?;
        if !matches!(base_url.scheme(), "http" | "https") || base_url.cannot_be_a_base() {
            return Err(TillSyncError::Config(format!(
                "Remote base URL must be http(s): {}",
                config.base_url
            )));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TillSyncError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client, base_url, api_token: config.api_token, timeout: config.timeout })
    }

    fn record_url(&self, entity: &str, key: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| TillSyncError::Config("Remote base URL cannot carry a path".into()))?
            .pop_if_empty()
            .push(entity)
            .push(key);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_request(&self, builder: RequestBuilder) -> std::result::Result<Response, SyncError> {
        let request = builder.build().map_err(|e| SyncError::Validation(e.to_string()))?;
        let method = request.method().clone();
        let url = request.url().clone();

        debug!(%method, %url, "sending remote request");

        let response = tokio::time::timeout(self.timeout, self.client.execute(request))
            .await
            .map_err(|_| SyncError::Timeout(self.timeout))?
            .map_err(|e| self.transport_error(&e))?;

        debug!(%method, %url, status = %response.status(), "received remote response");
        Ok(response)
    }

    fn transport_error(&self, err: &reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(self.timeout)
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    #[instrument(
        skip(self, identity, write),
        fields(client_id = %write.client_id, entity = %write.target_entity, op = %write.operation)
    )]
    async fn upsert(
        &self,
        identity: &IdentityContext,
        write: &RemoteWrite,
    ) -> std::result::Result<RemoteAck, SyncError> {
        let url = self
            .record_url(&write.target_entity, &write.record_key)
            .map_err(|e| SyncError::Validation(e.to_string()))?;

        let builder = match write.operation {
            QueueOperation::Create | QueueOperation::Update => {
                self.request(Method::PUT, url).json(&write.payload)
            }
            QueueOperation::Delete => self.request(Method::DELETE, url),
        }
        .header("Idempotency-Key", &write.client_id)
        .header("X-User-Id", &identity.user_id)
        .header("X-Store-Id", &identity.store_id)
        .header("X-Device-Id", &identity.device_id);

        let response = self.send_request(builder).await?;
        let status = response.status();

        if status.is_success() {
            let replayed = response
                .headers()
                .get(REPLAY_HEADER)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("true"));
            return Ok(RemoteAck { applied: !replayed });
        }

        if status == StatusCode::NOT_FOUND && write.operation == QueueOperation::Delete {
            debug!("record already absent remotely");
            return Ok(RemoteAck { applied: false });
        }

        let body = response.text().await.unwrap_or_default();
        let err = classify_status(status, &body);
        warn!(status = %status, error = %err, "remote rejected write");
        Err(err)
    }
}

#[async_trait]
impl SystemOfRecord for HttpRemoteStore {
    #[instrument(skip(self))]
    async fn fetch(&self, table: &str, key: &str) -> Result<Option<Value>> {
        let url = self.record_url(table, key)?;
        let response =
            self.send_request(self.request(Method::GET, url)).await.map_err(transport_to_domain)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().map_err(InfraError::from)?;
        let value = response.json::<Value>().await.map_err(InfraError::from)?;
        Ok(Some(value))
    }

    #[instrument(skip(self, value))]
    async fn apply(&self, table: &str, key: &str, value: &Value) -> Result<()> {
        let url = self.record_url(table, key)?;
        let response = self
            .send_request(self.request(Method::PUT, url).json(value))
            .await
            .map_err(transport_to_domain)?;
        response.error_for_status().map_err(InfraError::from)?;
        Ok(())
    }
}

/// Map a non-success HTTP status onto the retry taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> SyncError {
    let message = if body.trim().is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), body.trim())
    };

    match status.as_u16() {
        409 => SyncError::Conflict(message),
        401 | 403 => SyncError::Auth(message),
        429 => SyncError::RateLimit(message),
        500..=599 => SyncError::Server(message),
        // 400, 404, 422 and any other client error: the payload will not
        // succeed on replay.
        _ => SyncError::Validation(message),
    }
}

fn transport_to_domain(err: SyncError) -> TillSyncError {
    match err {
        SyncError::Validation(message) => TillSyncError::InvalidInput(message),
        other => TillSyncError::Network(other.to_string()),
    }
}
