//! Local upload storage for reconciliation files
//!
//! Uploads live as plain files directly under one directory; the upload id
//! is the file name.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tillsync_core::FileStore;
use tillsync_domain::{ReconciliationConfig, Result, TillSyncError};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &ReconciliationConfig) -> Self {
        Self::new(&config.upload_dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an upload id to a path inside the root.
    ///
    /// Only a single plain file name is accepted.
    fn resolve(&self, file_upload_id: &str) -> Result<PathBuf> {
        let mut components = Path::new(file_upload_id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if !file_upload_id.contains('\\') => {
                Ok(self.root.join(name))
            }
            _ => Err(TillSyncError::InvalidInput(format!(
                "invalid file upload id: {file_upload_id:?}"
            ))),
        }
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn fetch(&self, file_upload_id: &str) -> Result<Vec<u8>> {
        let path = self.resolve(file_upload_id)?;
        debug!(path = %path.display(), "reading upload");

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TillSyncError::NotFound(format!("file upload {file_upload_id}")))
            }
            Err(e) => Err(TillSyncError::Internal(format!(
                "failed to read upload {file_upload_id}: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn reads_uploads_by_id() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("upload-1.csv"), "sku,stock\nA,1\n").unwrap();
        let store = LocalFileStore::new(dir.path());

        assert_eq!(store.fetch("upload-1.csv").await.unwrap(), b"sku,stock\nA,1\n");
        assert!(matches!(
            store.fetch("upload-2.csv").await,
            Err(TillSyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_ids_escaping_the_root() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(dir.path().join("uploads"));
        std::fs::write(dir.path().join("secret.csv"), "x").unwrap();

        for id in ["../secret.csv", "/etc/passwd", "a/b.csv", "..", ".", "", "..\\secret.csv"] {
            assert!(
                matches!(store.fetch(id).await, Err(TillSyncError::InvalidInput(_))),
                "{id:?} should be rejected"
            );
        }
    }
}
