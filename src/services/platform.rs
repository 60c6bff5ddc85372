use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use super::PlatformSwitcher;
use crate::context::Platform;
use crate::host::HostControl;

/// Keeps the active platform in a file and optionally restarts the host
/// after every real switch.
pub struct FilePlatformSwitcher {
    path: PathBuf,
    supported: Vec<String>,
    restart_on_switch: bool,
    host: Arc<dyn HostControl>,
}

impl FilePlatformSwitcher {
    pub fn new(
        path: PathBuf,
        supported: Vec<String>,
        restart_on_switch: bool,
        host: Arc<dyn HostControl>,
    ) -> Self {
        Self {
            path,
            supported,
            restart_on_switch,
            host,
        }
    }
}

#[async_trait]
impl PlatformSwitcher for FilePlatformSwitcher {
    async fn current(&self) -> Result<Option<Platform>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let name = content.trim();
                Ok((!name.is_empty()).then(|| Platform::new(name)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    async fn switch_to(&self, target: &Platform) -> Result<()> {
        if !self.supported.iter().any(|p| p == target.as_str()) {
            bail!(
                "Platform '{}' is not supported. Supported: {}",
                target,
                self.supported.join(", ")
            );
        }

        if self.current().await?.as_ref() == Some(target) {
            tracing::debug!(platform = %target, "already active");
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, format!("{}\n", target))
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;

        let active = self.current().await?;
        if active.as_ref() != Some(target) {
            bail!(
                "Switch to '{}' did not take effect (active: {})",
                target,
                active.map(|p| p.to_string()).unwrap_or_else(|| "none".into())
            );
        }

        tracing::info!(platform = %target, "switched platform");
        if self.restart_on_switch {
            self.host
                .request_restart(&format!("switched platform to {}", target));
        }
        Ok(())
    }
}
