//! Static pipeline descriptor.
//!
//! Read once per process start from `stagehand.toml` in the project
//! directory. Settings layer file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [artifact]
//! id = "avtr_5c1f"
//! name = "Lobby avatar"
//! output = "build/{platform}/avatar.bundle"
//! build_command = "./scripts/build.sh"
//!
//! [platforms]
//! targets = ["windows", "android"]
//! restore = "windows"
//! supported = ["windows", "android", "ios"]
//! restart_on_switch = true
//!
//! [upload]
//! enabled = true
//! destination = "main"
//! extra_targets = ["beta"]
//! size_budget_bytes = 209715200
//! remote_dir = ".stagehand/remote"
//!
//! [metadata]
//! payload = "build 42"
//! sink = ".stagehand/metadata.txt"
//!
//! [login]
//! user = "usr_ab12"
//! max_attempts = 3
//! backoff_ms = 500
//!
//! [steps.overrides."publish:*"]
//! retry_limit = 5
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::context::UploadPlan;
use crate::errors::ConfigError;
use crate::step::InterruptionPolicy;

pub const CONFIG_FILE_NAME: &str = "stagehand.toml";
pub const STATE_DIR_NAME: &str = ".stagehand";

/// What to build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSection {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Output path relative to the project; `{platform}` is substituted.
    #[serde(default = "default_output")]
    pub output: String,
    /// Shell command producing the artifact (default: env `STAGEHAND_BUILD_COMMAND`)
    #[serde(default)]
    pub build_command: Option<String>,
}

fn default_output() -> String {
    "build/{platform}/artifact.bin".to_string()
}

impl Default for ArtifactSection {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: None,
            output: default_output(),
            build_command: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformsSection {
    /// Platforms to build for, in order.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Platform to switch back to once everything is published.
    #[serde(default)]
    pub restore: Option<String>,
    /// Platforms the switcher accepts. Empty means targets + restore.
    #[serde(default)]
    pub supported: Vec<String>,
    /// Whether a platform switch restarts the host process.
    #[serde(default)]
    pub restart_on_switch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub extra_targets: Vec<String>,
    #[serde(default = "default_size_budget")]
    pub size_budget_bytes: u64,
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
}

fn default_true() -> bool {
    true
}

fn default_size_budget() -> u64 {
    200 * 1024 * 1024
}

fn default_remote_dir() -> String {
    format!("{}/remote", STATE_DIR_NAME)
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            destination: None,
            extra_targets: Vec::new(),
            size_budget_bytes: default_size_budget(),
            remote_dir: default_remote_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataSection {
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default = "default_metadata_sink")]
    pub sink: String,
}

fn default_metadata_sink() -> String {
    format!("{}/metadata.txt", STATE_DIR_NAME)
}

impl Default for MetadataSection {
    fn default() -> Self {
        Self {
            payload: None,
            sink: default_metadata_sink(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginSection {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_login_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_login_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

impl Default for LoginSection {
    fn default() -> Self {
        Self {
            user: None,
            max_attempts: default_login_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// Per-step override settings, matched by glob on the step name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOverride {
    #[serde(default)]
    pub retry_limit: Option<u32>,
    #[serde(default)]
    pub policy: Option<InterruptionPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepsSection {
    /// Pattern-based overrides (e.g., "publish:*" -> StepOverride)
    #[serde(default)]
    pub overrides: BTreeMap<String, StepOverride>,
}

/// The complete stagehand.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagehandToml {
    #[serde(default)]
    pub artifact: ArtifactSection,
    #[serde(default)]
    pub platforms: PlatformsSection,
    #[serde(default)]
    pub upload: UploadSection,
    #[serde(default)]
    pub metadata: MetadataSection,
    #[serde(default)]
    pub login: LoginSection,
    #[serde(default)]
    pub steps: StepsSection,
}

impl StagehandToml {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse stagehand.toml")
    }

    /// Platforms the switcher will accept.
    pub fn supported_platforms(&self) -> Vec<String> {
        if !self.platforms.supported.is_empty() {
            return self.platforms.supported.clone();
        }
        let mut supported = self.platforms.targets.clone();
        if let Some(restore) = &self.platforms.restore
            && !supported.contains(restore)
        {
            supported.push(restore.clone());
        }
        supported
    }

    /// Reject descriptors no run could succeed with.
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid { message });

        if self.artifact.id.trim().is_empty() {
            return invalid("artifact.id is required".to_string());
        }
        if self.platforms.targets.is_empty() {
            return invalid("platforms.targets must list at least one platform".to_string());
        }

        let mut seen = Vec::new();
        for target in &self.platforms.targets {
            if !is_valid_platform_name(target) {
                return invalid(format!(
                    "platform '{}' may not be blank or contain whitespace or '.'",
                    target
                ));
            }
            if seen.contains(&target) {
                return invalid(format!("platform '{}' is listed twice", target));
            }
            seen.push(target);
        }

        let supported = self.supported_platforms();
        for platform in self
            .platforms
            .targets
            .iter()
            .chain(self.platforms.restore.iter())
        {
            if !supported.contains(platform) {
                return invalid(format!(
                    "platform '{}' is not in platforms.supported",
                    platform
                ));
            }
        }

        if self.upload.enabled && self.upload.destination.is_none() {
            return invalid(
                "upload.destination is required when upload.enabled is true".to_string(),
            );
        }

        Ok(())
    }

    /// Non-fatal problems worth reporting.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.artifact.build_command.is_none() {
            warnings.push(
                "artifact.build_command is not set; builds rely on STAGEHAND_BUILD_COMMAND"
                    .to_string(),
            );
        }
        if self.upload.enabled && self.upload.size_budget_bytes == 0 {
            warnings.push("upload.size_budget_bytes is 0; every upload will be rejected".into());
        }
        if !self.artifact.output.contains("{platform}") && self.platforms.targets.len() > 1 {
            warnings.push(format!(
                "artifact.output '{}' has no {{platform}} placeholder; platforms overwrite each other",
                self.artifact.output
            ));
        }
        if self.platforms.restore.is_none() {
            warnings.push("platforms.restore is not set; the environment is left as-is".into());
        }
        for (pattern, override_cfg) in &self.steps.overrides {
            if override_cfg.retry_limit.is_some()
                && override_cfg
                    .policy
                    .is_some_and(|p| p != InterruptionPolicy::Retry)
            {
                warnings.push(format!(
                    "Override '{}' sets retry_limit with a non-retry policy; the limit is ignored",
                    pattern
                ));
            }
        }

        warnings
    }
}

fn is_valid_platform_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.chars().any(|c| c.is_whitespace() || c == '.')
}

/// Runtime configuration: the parsed descriptor plus where things live.
#[derive(Debug, Clone)]
pub struct StagehandConfig {
    pub project_dir: PathBuf,
    pub config_path: PathBuf,
    pub state_dir: PathBuf,
    pub toml: StagehandToml,
    pub verbose: bool,
}

impl StagehandConfig {
    /// Load and validate the descriptor. `config_path` defaults to
    /// `<project>/stagehand.toml`.
    pub fn load(
        project_dir: &Path,
        config_path: Option<&Path>,
        verbose: bool,
    ) -> Result<Self, ConfigError> {
        let config_path = match config_path {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => project_dir.join(path),
            None => project_dir.join(CONFIG_FILE_NAME),
        };
        let mut toml = StagehandToml::load(&config_path)?;
        apply_env_overrides(&mut toml);
        toml.ensure_valid()?;

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            config_path,
            state_dir: state_dir(project_dir),
            toml,
            verbose,
        })
    }

    pub fn cursor_file(&self) -> PathBuf {
        cursor_file(&self.project_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        log_dir(&self.project_dir)
    }

    pub fn platform_file(&self) -> PathBuf {
        self.state_dir.join("platform")
    }

    /// Resolve a configured path against the project directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.project_dir.join(p)
        }
    }

    pub fn upload_plan(&self) -> UploadPlan {
        let upload = &self.toml.upload;
        let mut destinations: Vec<String> = Vec::new();
        for dest in upload.destination.iter().chain(upload.extra_targets.iter()) {
            if !destinations.contains(dest) {
                destinations.push(dest.clone());
            }
        }
        UploadPlan {
            enabled: upload.enabled,
            destinations,
            size_budget_bytes: upload.size_budget_bytes,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).context("Failed to create state directory")?;
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        Ok(())
    }
}

pub fn state_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(STATE_DIR_NAME)
}

pub fn cursor_file(project_dir: &Path) -> PathBuf {
    state_dir(project_dir).join("cursor.json")
}

pub fn log_dir(project_dir: &Path) -> PathBuf {
    state_dir(project_dir).join("logs")
}

fn apply_env_overrides(toml: &mut StagehandToml) {
    if let Ok(user) = std::env::var("STAGEHAND_USER")
        && !user.is_empty()
    {
        toml.login.user = Some(user);
    }
    if let Ok(command) = std::env::var("STAGEHAND_BUILD_COMMAND")
        && !command.is_empty()
    {
        toml.artifact.build_command = Some(command);
    }
    if let Ok(val) = std::env::var("STAGEHAND_UPLOAD") {
        toml.upload.enabled = val != "false" && val != "0";
    }
}

/// Check if a glob pattern matches a step name.
/// - `*` matches any sequence of characters
/// - `?` matches any single character
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    glob_match(&pattern.to_lowercase(), &name.to_lowercase())
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let mut pattern_chars = pattern.chars().peekable();
    let mut text_chars = text.chars().peekable();

    while let Some(p) = pattern_chars.next() {
        match p {
            '*' => {
                while pattern_chars.peek() == Some(&'*') {
                    pattern_chars.next();
                }
                if pattern_chars.peek().is_none() {
                    return true;
                }

                let remaining_pattern: String = pattern_chars.collect();
                let remaining_text: Vec<char> = text_chars.collect();
                for i in 0..=remaining_text.len() {
                    let rest: String = remaining_text[i..].iter().collect();
                    if glob_match(&remaining_pattern, &rest) {
                        return true;
                    }
                }
                return false;
            }
            '?' => {
                if text_chars.next().is_none() {
                    return false;
                }
            }
            c => {
                if text_chars.next() != Some(c) {
                    return false;
                }
            }
        }
    }

    text_chars.next().is_none()
}
