//! External collaborators the pipeline steps call into.
//!
//! | Trait              | Local implementation     | Backing                         |
//! |--------------------|--------------------------|---------------------------------|
//! | `LoginService`     | `ConfigLoginService`     | `login.user` / `STAGEHAND_USER` |
//! | `BuildService`     | `CommandBuildService`    | `sh -c <build_command>`         |
//! | `UploadService`    | `DirectoryUploadService` | `<remote_dir>/<destination>/`   |
//! | `PlatformSwitcher` | `FilePlatformSwitcher`   | `.stagehand/platform`           |
//! | `MetadataSink`     | `FileMetadataSink`       | `metadata.sink` file            |
//!
//! Every trait is object safe so tests can substitute fakes.

pub mod build;
pub mod login;
pub mod metadata;
pub mod platform;
pub mod upload;

pub use build::CommandBuildService;
pub use login::ConfigLoginService;
pub use metadata::FileMetadataSink;
pub use platform::FilePlatformSwitcher;
pub use upload::DirectoryUploadService;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::StagehandConfig;
use crate::context::Platform;
use crate::host::HostControl;

/// The account artifacts are published under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub display_name: String,
}

/// A locally built artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub platform: Platform,
    pub path: PathBuf,
    /// Hex SHA-256 of the file contents.
    pub signature: String,
    pub size_bytes: u64,
    pub built_at: DateTime<Utc>,
}

/// An artifact as it exists at an upload destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteArtifact {
    pub destination_id: String,
    pub location: PathBuf,
    pub version: u64,
    pub uploaded_at: DateTime<Utc>,
}

#[async_trait]
pub trait LoginService: Send + Sync {
    async fn login(&self) -> Result<UserIdentity>;
}

#[async_trait]
pub trait BuildService: Send + Sync {
    /// Build `artifact_id` for whatever platform is currently active.
    async fn build_for_current_target(
        &self,
        artifact_id: &str,
        platform: &Platform,
        output: &Path,
    ) -> Result<ArtifactHandle>;
}

#[async_trait]
pub trait UploadService: Send + Sync {
    async fn upload(
        &self,
        artifact: &ArtifactHandle,
        destination_id: &str,
        identity: &UserIdentity,
    ) -> Result<RemoteArtifact>;
}

#[async_trait]
pub trait PlatformSwitcher: Send + Sync {
    /// The platform the environment is currently set to, if any.
    async fn current(&self) -> Result<Option<Platform>>;

    /// Switch the environment. May restart the host process.
    async fn switch_to(&self, target: &Platform) -> Result<()>;
}

/// Best-effort sink for descriptive metadata.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    async fn apply(&self, payload: &str);
}

/// The collaborator set the built-in steps are wired with.
#[derive(Clone)]
pub struct Services {
    pub login: Arc<dyn LoginService>,
    pub build: Arc<dyn BuildService>,
    pub upload: Arc<dyn UploadService>,
    pub platform: Arc<dyn PlatformSwitcher>,
    pub metadata: Arc<dyn MetadataSink>,
}

impl Services {
    /// Local, filesystem-backed collaborators driven by the configuration.
    pub fn local(config: &StagehandConfig, host: Arc<dyn HostControl>) -> Self {
        let toml = &config.toml;
        Self {
            login: Arc::new(ConfigLoginService::new(
                toml.login.user.clone(),
                toml.login.max_attempts,
                toml.login.backoff_ms,
            )),
            build: Arc::new(CommandBuildService::new(
                config.project_dir.clone(),
                toml.artifact.build_command.clone(),
            )),
            upload: Arc::new(DirectoryUploadService::new(
                config.resolve(&toml.upload.remote_dir),
                toml.upload.size_budget_bytes,
            )),
            platform: Arc::new(FilePlatformSwitcher::new(
                config.platform_file(),
                toml.supported_platforms(),
                toml.platforms.restart_on_switch,
                host,
            )),
            metadata: Arc::new(FileMetadataSink::new(config.resolve(&toml.metadata.sink))),
        }
    }
}
