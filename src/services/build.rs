use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::{ArtifactHandle, BuildService};
use crate::context::Platform;

/// Builds by running a shell command in the project directory.
///
/// The command sees `STAGEHAND_ARTIFACT_ID`, `STAGEHAND_PLATFORM` and
/// `STAGEHAND_OUTPUT`, and must write the artifact to `STAGEHAND_OUTPUT`.
pub struct CommandBuildService {
    project_dir: PathBuf,
    command: Option<String>,
}

impl CommandBuildService {
    pub fn new(project_dir: PathBuf, command: Option<String>) -> Self {
        Self {
            project_dir,
            command,
        }
    }
}

#[async_trait]
impl BuildService for CommandBuildService {
    async fn build_for_current_target(
        &self,
        artifact_id: &str,
        platform: &Platform,
        output: &Path,
    ) -> Result<ArtifactHandle> {
        let Some(command) = self
            .command
            .clone()
            .or_else(|| std::env::var("STAGEHAND_BUILD_COMMAND").ok())
        else {
            bail!("No build command configured: set artifact.build_command");
        };

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let previous = match tokio::fs::metadata(output).await {
            Ok(meta) => Some((meta.modified().ok(), file_signature(output).await?)),
            Err(_) => None,
        };
        tracing::info!(artifact = artifact_id, platform = %platform, "building");

        let result = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&self.project_dir)
            .env("STAGEHAND_ARTIFACT_ID", artifact_id)
            .env("STAGEHAND_PLATFORM", platform.as_str())
            .env("STAGEHAND_OUTPUT", output)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to spawn build command: {}", command))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            bail!(
                "Build command exited with {}: {}",
                result.status,
                stderr.trim()
            );
        }

        let meta = tokio::fs::metadata(output).await.with_context(|| {
            format!("Build succeeded but produced no file at {}", output.display())
        })?;
        let modified = meta.modified().context("Failed to read artifact mtime")?;
        let signature = file_signature(output).await?;
        // Same mtime and same bytes means the command never touched the file.
        if let Some((before, old_signature)) = previous
            && before == Some(modified)
            && old_signature == signature
        {
            bail!(
                "Build succeeded but {} was not rewritten (stale artifact)",
                output.display()
            );
        }

        tracing::debug!(path = %output.display(), %signature, "artifact built");

        Ok(ArtifactHandle {
            platform: platform.clone(),
            path: output.to_path_buf(),
            signature,
            size_bytes: meta.len(),
            built_at: Utc::now(),
        })
    }
}

/// Hex SHA-256 of a file's contents.
pub async fn file_signature(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}
