use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{ArtifactHandle, RemoteArtifact, UploadService, UserIdentity};

const MANIFEST_FILE: &str = "manifest.json";

/// Per-destination bookkeeping.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    owner: Option<String>,
    #[serde(default)]
    platforms: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    version: u64,
    signature: String,
    location: PathBuf,
}

/// Publishes into `<remote_dir>/<destination>/<platform>/v<N>`.
///
/// The first uploader claims a destination; later uploads by another user
/// are refused. Re-uploading an identical artifact is a no-op that returns
/// the existing version, so a retried publish never double-versions.
pub struct DirectoryUploadService {
    remote_dir: PathBuf,
    size_budget_bytes: u64,
}

impl DirectoryUploadService {
    pub fn new(remote_dir: PathBuf, size_budget_bytes: u64) -> Self {
        Self {
            remote_dir,
            size_budget_bytes,
        }
    }

    async fn read_manifest(path: &Path) -> Result<Manifest> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Corrupt upload manifest at {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn write_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
        let content = serde_json::to_string_pretty(manifest)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl UploadService for DirectoryUploadService {
    async fn upload(
        &self,
        artifact: &ArtifactHandle,
        destination_id: &str,
        identity: &UserIdentity,
    ) -> Result<RemoteArtifact> {
        if artifact.size_bytes > self.size_budget_bytes {
            bail!(
                "Artifact is {} bytes, over the {} byte upload budget",
                artifact.size_bytes,
                self.size_budget_bytes
            );
        }

        let dest_dir = self.remote_dir.join(destination_id);
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .with_context(|| format!("Failed to create {}", dest_dir.display()))?;
        let manifest_path = dest_dir.join(MANIFEST_FILE);
        let mut manifest = Self::read_manifest(&manifest_path).await?;

        let owner = manifest
            .owner
            .get_or_insert_with(|| identity.id.clone());
        if owner != &identity.id {
            bail!(
                "Destination '{}' belongs to '{}', not '{}'",
                destination_id,
                owner,
                identity.id
            );
        }

        let platform = artifact.platform.as_str().to_string();
        if let Some(existing) = manifest.platforms.get(&platform)
            && existing.signature == artifact.signature
        {
            tracing::debug!(destination = destination_id, version = existing.version, "already uploaded");
            return Ok(RemoteArtifact {
                destination_id: destination_id.to_string(),
                location: existing.location.clone(),
                version: existing.version,
                uploaded_at: Utc::now(),
            });
        }

        let version = manifest
            .platforms
            .get(&platform)
            .map(|e| e.version + 1)
            .unwrap_or(1);
        let platform_dir = dest_dir.join(&platform);
        tokio::fs::create_dir_all(&platform_dir).await?;
        let location = platform_dir.join(format!("v{}", version));
        tokio::fs::copy(&artifact.path, &location)
            .await
            .with_context(|| {
                format!(
                    "Failed to copy {} to {}",
                    artifact.path.display(),
                    location.display()
                )
            })?;

        manifest.platforms.insert(
            platform,
            ManifestEntry {
                version,
                signature: artifact.signature.clone(),
                location: location.clone(),
            },
        );
        Self::write_manifest(&manifest_path, &manifest).await?;

        tracing::info!(destination = destination_id, version, "uploaded");
        Ok(RemoteArtifact {
            destination_id: destination_id.to_string(),
            location,
            version,
            uploaded_at: Utc::now(),
        })
    }
}
