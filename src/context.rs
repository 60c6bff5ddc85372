//! Shared unit-of-work state for one pipeline run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::config::StagehandConfig;
use crate::cursor::{CursorManager, StepProgress};
use crate::services::{RemoteArtifact, UserIdentity};

/// A build target platform, e.g. `windows` or `android`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Platform(String);

impl Platform {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Platform {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// What is being built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub id: String,
    pub name: String,
    /// Output path; `{platform}` is replaced with the target platform.
    pub output: PathBuf,
}

impl ArtifactSpec {
    pub fn output_for(&self, platform: &Platform) -> PathBuf {
        let raw = self.output.to_string_lossy();
        PathBuf::from(raw.replace("{platform}", platform.as_str()))
    }
}

/// Where built artifacts go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPlan {
    pub enabled: bool,
    /// Primary destination first, then the explicit extra targets.
    pub destinations: Vec<String>,
    pub size_budget_bytes: u64,
}

/// How far a single target platform has progressed in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlatformProgress {
    #[default]
    Pending,
    Built,
    Published,
}

/// The single mutable state object threaded through every step.
///
/// Rebuilt from configuration on each process start; only the cursor (and
/// step sub-progress reached through [`BuildContext::progress`]) survives a
/// restart.
pub struct BuildContext {
    pub artifact: ArtifactSpec,
    pub targets: Vec<Platform>,
    pub platform_progress: BTreeMap<Platform, PlatformProgress>,
    pub metadata: Option<String>,
    pub upload: UploadPlan,
    /// Platform `restore-platform` switches back to.
    pub restore_platform: Option<Platform>,
    pub identity: Option<UserIdentity>,
    pub published: Vec<RemoteArtifact>,
    cursor: CursorManager,
    current_step: Option<String>,
}

impl BuildContext {
    pub fn new(artifact: ArtifactSpec, cursor: CursorManager) -> Self {
        Self {
            artifact,
            targets: Vec::new(),
            platform_progress: BTreeMap::new(),
            metadata: None,
            upload: UploadPlan::default(),
            restore_platform: None,
            identity: None,
            published: Vec::new(),
            cursor,
            current_step: None,
        }
    }

    pub fn from_config(config: &StagehandConfig, cursor: CursorManager) -> Self {
        let toml = &config.toml;
        let mut ctx = Self::new(
            ArtifactSpec {
                id: toml.artifact.id.clone(),
                name: toml
                    .artifact
                    .name
                    .clone()
                    .unwrap_or_else(|| toml.artifact.id.clone()),
                output: config.resolve(&toml.artifact.output),
            },
            cursor,
        );
        ctx.targets = toml
            .platforms
            .targets
            .iter()
            .map(|p| Platform::new(p.as_str()))
            .collect();
        ctx.platform_progress = ctx
            .targets
            .iter()
            .map(|p| (p.clone(), PlatformProgress::Pending))
            .collect();
        ctx.metadata = toml.metadata.payload.clone();
        ctx.upload = config.upload_plan();
        ctx.restore_platform = toml.platforms.restore.as_deref().map(Platform::from);
        ctx
    }

    pub fn with_targets(mut self, targets: impl IntoIterator<Item = Platform>) -> Self {
        self.targets = targets.into_iter().collect();
        self.platform_progress = self
            .targets
            .iter()
            .map(|p| (p.clone(), PlatformProgress::Pending))
            .collect();
        self
    }

    pub fn with_upload(mut self, upload: UploadPlan) -> Self {
        self.upload = upload;
        self
    }

    /// Name of the step currently holding the context, if any.
    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    /// Sub-progress scoped to the running step.
    pub fn progress(&self) -> StepProgress {
        self.cursor
            .progress(self.current_step.as_deref().unwrap_or("_pipeline"))
    }

    pub fn mark_platform(&mut self, platform: &Platform, progress: PlatformProgress) {
        self.platform_progress.insert(platform.clone(), progress);
    }

    pub fn platform_state(&self, platform: &Platform) -> PlatformProgress {
        self.platform_progress
            .get(platform)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn enter_step(&mut self, name: &str) {
        self.current_step = Some(name.to_string());
    }

    pub(crate) fn leave_step(&mut self) {
        self.current_step = None;
    }
}
