//! Built-in build-and-publish steps.
//!
//! | Step               | Order      | Policy   | Retry limit | Registered when        |
//! |--------------------|------------|----------|-------------|------------------------|
//! | `login`            | 0          | retry    | 2           | always                 |
//! | `apply-metadata`   | 10         | retry    | 1           | always                 |
//! | `switch:<p>`       | 100 + 10k  | continue | -           | per target platform    |
//! | `publish:<p>`      | 105 + 10k  | retry    | 3           | per target platform    |
//! | `restore-platform` | 1000 (min) | continue | -           | `platforms.restore` set |
//!
//! `k` is the platform's position in `platforms.targets`. With more than 90
//! targets `restore-platform` moves to `100 + 10n` so it still runs last.

pub mod account;
pub mod metadata;
pub mod platforms;

pub use account::{AccountSteps, ensure_identity};
pub use metadata::MetadataSteps;
pub use platforms::PlatformSteps;

use crate::config::StagehandConfig;
use crate::context::Platform;
use crate::registry::{StepRegistry, StepSource};
use crate::services::Services;

/// The step sources for a configuration, in registration order.
pub fn builtin_sources(config: &StagehandConfig, services: &Services) -> Vec<Box<dyn StepSource>> {
    let toml = &config.toml;
    vec![
        Box::new(AccountSteps::new(services.login.clone())),
        Box::new(MetadataSteps::new(services.metadata.clone())),
        Box::new(PlatformSteps::new(
            toml.platforms.targets.iter().map(|p| Platform::new(p.as_str())).collect(),
            toml.platforms.restore.is_some(),
            services.clone(),
        )),
    ]
}

/// Registry of every built-in step with the configured overrides applied.
pub fn builtin_registry(config: &StagehandConfig, services: &Services) -> StepRegistry {
    StepRegistry::from_sources(&builtin_sources(config, services))
        .with_overrides(config.toml.steps.overrides.clone())
}
