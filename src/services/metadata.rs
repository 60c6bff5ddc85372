use async_trait::async_trait;
use std::path::PathBuf;

use super::MetadataSink;

/// Writes the metadata payload to a file. Failures are logged, never raised.
pub struct FileMetadataSink {
    path: PathBuf,
}

impl FileMetadataSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl MetadataSink for FileMetadataSink {
    async fn apply(&self, payload: &str) {
        if let Some(parent) = self.path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            tracing::warn!(path = %parent.display(), error = %e, "could not create metadata dir");
            return;
        }
        match tokio::fs::write(&self.path, payload).await {
            Ok(()) => tracing::debug!(path = %self.path.display(), "metadata applied"),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "metadata not applied")
            }
        }
    }
}
