//! Per-platform switch and publish steps, plus the final restore.
//!
//! A switch may restart the host, so it carries the continue policy: the
//! switch having happened is the step's whole effect. Publishing re-checks
//! the active platform before building, which covers a switch that was
//! killed before it took effect.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use super::account::ensure_identity;
use crate::context::{BuildContext, Platform, PlatformProgress};
use crate::logging::LOG_TAG;
use crate::registry::{StepRegistry, StepSource};
use crate::services::build::file_signature;
use crate::services::{ArtifactHandle, PlatformSwitcher, Services};
use crate::step::{ContextAction, InterruptionPolicy, StepAction, StepDescriptor};

pub const RESTORE_STEP: &str = "restore-platform";

/// Sub-progress key holding the built [`ArtifactHandle`].
const ARTIFACT_KEY: &str = "artifact";
/// Sub-progress key counting destinations already uploaded to.
const UPLOADED_KEY: &str = "uploaded";

const PLATFORM_ORDER_BASE: i32 = 100;
const PLATFORM_ORDER_STRIDE: i32 = 10;
const PUBLISH_ORDER_OFFSET: i32 = 5;
/// Lowest order for `restore-platform`; pushed later when targets need the room.
const RESTORE_ORDER: i32 = 1000;

/// Order of the k-th target's switch step.
fn platform_order(k: usize) -> i32 {
    let k = i32::try_from(k).unwrap_or(i32::MAX);
    PLATFORM_ORDER_BASE.saturating_add(PLATFORM_ORDER_STRIDE.saturating_mul(k))
}

/// Order of `restore-platform`: after every platform step.
fn restore_order(target_count: usize) -> i32 {
    RESTORE_ORDER.max(platform_order(target_count))
}

pub fn switch_step_name(platform: &Platform) -> String {
    format!("switch:{}", platform)
}

pub fn publish_step_name(platform: &Platform) -> String {
    format!("publish:{}", platform)
}

/// Contributes `switch:<p>` and `publish:<p>` for every target, then
/// `restore-platform` when a restore platform is configured.
pub struct PlatformSteps {
    targets: Vec<Platform>,
    restore: bool,
    services: Services,
}

impl PlatformSteps {
    pub fn new(targets: Vec<Platform>, restore: bool, services: Services) -> Self {
        Self {
            targets,
            restore,
            services,
        }
    }
}

impl StepSource for PlatformSteps {
    fn name(&self) -> &str {
        "platforms"
    }

    fn register(&self, registry: &mut StepRegistry) {
        for (k, platform) in self.targets.iter().enumerate() {
            let base = platform_order(k);
            registry.register(
                StepDescriptor::new(switch_step_name(platform))
                    .order(base)
                    .policy(InterruptionPolicy::Continue)
                    .action(StepAction::with_context(SwitchPlatform {
                        platform: platform.clone(),
                        switcher: self.services.platform.clone(),
                    })),
            );
            registry.register(
                StepDescriptor::new(publish_step_name(platform))
                    .order(base.saturating_add(PUBLISH_ORDER_OFFSET))
                    .policy(InterruptionPolicy::Retry)
                    .retry_limit(3)
                    .action(StepAction::with_context(PublishPlatform {
                        platform: platform.clone(),
                        services: self.services.clone(),
                    })),
            );
        }

        if self.restore {
            registry.register(
                StepDescriptor::new(RESTORE_STEP)
                    .order(restore_order(self.targets.len()))
                    .policy(InterruptionPolicy::Continue)
                    .action(StepAction::with_context(RestorePlatform {
                        switcher: self.services.platform.clone(),
                    })),
            );
        }
    }
}

struct SwitchPlatform {
    platform: Platform,
    switcher: Arc<dyn PlatformSwitcher>,
}

#[async_trait]
impl ContextAction for SwitchPlatform {
    async fn run(&self, _ctx: &mut BuildContext) -> Result<()> {
        self.switcher
            .switch_to(&self.platform)
            .await
            .with_context(|| format!("Could not switch to {}", self.platform))
    }
}

/// Switches to the context's restore platform, if it names one.
struct RestorePlatform {
    switcher: Arc<dyn PlatformSwitcher>,
}

#[async_trait]
impl ContextAction for RestorePlatform {
    async fn run(&self, ctx: &mut BuildContext) -> Result<()> {
        let Some(platform) = ctx.restore_platform.clone() else {
            tracing::debug!("no restore platform in context");
            return Ok(());
        };
        self.switcher
            .switch_to(&platform)
            .await
            .with_context(|| format!("Could not restore {}", platform))
    }
}

struct PublishPlatform {
    platform: Platform,
    services: Services,
}

impl PublishPlatform {
    /// The artifact from an earlier attempt, if it is still on disk unchanged.
    async fn reusable_artifact(
        &self,
        ctx: &BuildContext,
        saved: Option<ArtifactHandle>,
    ) -> Option<ArtifactHandle> {
        let handle = saved?;
        if handle.path != ctx.artifact.output_for(&self.platform) {
            return None;
        }
        let signature = file_signature(&handle.path).await.ok()?;
        (signature == handle.signature).then_some(handle)
    }
}

#[async_trait]
impl ContextAction for PublishPlatform {
    async fn run(&self, ctx: &mut BuildContext) -> Result<()> {
        let switcher = &self.services.platform;
        if switcher.current().await?.as_ref() != Some(&self.platform) {
            tracing::warn!(
                "{} {} is not the active platform, switching before build",
                LOG_TAG,
                self.platform
            );
            switcher
                .switch_to(&self.platform)
                .await
                .with_context(|| format!("Could not switch to {}", self.platform))?;
        }

        let progress = ctx.progress();
        let saved = progress.get::<ArtifactHandle>(ARTIFACT_KEY)?;
        let artifact = match self.reusable_artifact(ctx, saved).await {
            Some(handle) => {
                tracing::info!(
                    "{} Reusing {} artifact from an earlier attempt",
                    LOG_TAG,
                    self.platform
                );
                handle
            }
            None => {
                progress.set_u64(UPLOADED_KEY, 0)?;
                let output = ctx.artifact.output_for(&self.platform);
                let handle = self
                    .services
                    .build
                    .build_for_current_target(&ctx.artifact.id, &self.platform, &output)
                    .await
                    .with_context(|| format!("Build for {} failed", self.platform))?;
                progress.set(ARTIFACT_KEY, &handle)?;
                handle
            }
        };
        ctx.mark_platform(&self.platform, PlatformProgress::Built);

        if !ctx.upload.enabled {
            tracing::info!("{} Upload disabled, {} built only", LOG_TAG, self.platform);
            return Ok(());
        }

        let identity = ensure_identity(ctx, self.services.login.as_ref()).await?;
        let destinations = ctx.upload.destinations.clone();
        let already = progress.get_u64(UPLOADED_KEY)?.unwrap_or(0) as usize;

        for (i, destination) in destinations.iter().enumerate().skip(already) {
            let remote = self
                .services
                .upload
                .upload(&artifact, destination, &identity)
                .await
                .with_context(|| {
                    format!("Upload of {} to '{}' failed", self.platform, destination)
                })?;
            progress.set_u64(UPLOADED_KEY, (i + 1) as u64)?;
            tracing::info!(
                "{} Published {} to '{}' (v{})",
                LOG_TAG,
                self.platform,
                destination,
                remote.version
            );
            ctx.published.push(remote);
        }

        ctx.mark_platform(&self.platform, PlatformProgress::Published);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{Fakes, context, memory_cursor};
    use crate::step::Step;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    fn steps(fakes: &Fakes, targets: &[&str], restore: bool) -> Vec<Step> {
        let mut registry = StepRegistry::new();
        PlatformSteps::new(
            targets.iter().map(|t| Platform::new(*t)).collect(),
            restore,
            fakes.services(),
        )
        .register(&mut registry);
        registry.assemble()
    }

    fn find<'a>(steps: &'a [Step], name: &str) -> &'a Step {
        steps.iter().find(|s| s.name == name).unwrap()
    }

    #[test]
    fn test_orders_and_policies() {
        let fakes = Fakes::new();
        let steps = steps(&fakes, &["pc", "android"], true);

        let summary: Vec<(String, i32, InterruptionPolicy)> = steps
            .iter()
            .map(|s| (s.name.clone(), s.order, s.policy))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("switch:pc".into(), 100, InterruptionPolicy::Continue),
                ("publish:pc".into(), 105, InterruptionPolicy::Retry),
                ("switch:android".into(), 110, InterruptionPolicy::Continue),
                ("publish:android".into(), 115, InterruptionPolicy::Retry),
                ("restore-platform".into(), 1000, InterruptionPolicy::Continue),
            ]
        );
    }

    #[test]
    fn test_restore_stays_last_with_many_targets() {
        let fakes = Fakes::new();
        let names: Vec<String> = (0..120).map(|i| format!("p{}", i)).collect();
        let targets: Vec<&str> = names.iter().map(String::as_str).collect();
        let steps = steps(&fakes, &targets, true);

        assert_eq!(steps.len(), 241);
        let last = steps.last().unwrap();
        assert_eq!(last.name, RESTORE_STEP);
        assert!(last.order > steps[steps.len() - 2].order);
        assert_eq!(steps[steps.len() - 2].name, "publish:p119");
    }

    #[test]
    fn test_restore_order_is_fixed_for_few_targets() {
        assert_eq!(restore_order(2), 1000);
        assert_eq!(restore_order(90), 1000);
        assert_eq!(restore_order(91), 1010);
    }

    #[tokio::test]
    async fn test_restore_uses_context_platform() {
        let dir = tempdir().unwrap();
        let fakes = Fakes::new();
        let steps = steps(&fakes, &["android"], true);
        let restore = find(&steps, RESTORE_STEP);

        let mut ctx = context(dir.path(), memory_cursor(), &["android"]);
        restore.action.invoke(&mut ctx).await.unwrap();
        assert!(fakes.platform.switches().is_empty());

        ctx.restore_platform = Some(Platform::new("pc"));
        restore.action.invoke(&mut ctx).await.unwrap();
        assert_eq!(fakes.platform.switches(), vec![Platform::new("pc")]);
    }

    #[tokio::test]
    async fn test_publish_switches_if_platform_is_wrong() {
        let dir = tempdir().unwrap();
        let fakes = Fakes::new();
        let steps = steps(&fakes, &["android"], false);
        let mut ctx = context(dir.path(), memory_cursor(), &["android"]);

        let publish = find(&steps, "publish:android");
        ctx.enter_step(&publish.name);
        publish.action.invoke(&mut ctx).await.unwrap();

        assert_eq!(fakes.platform.switches(), vec![Platform::new("android")]);
        assert_eq!(
            ctx.platform_state(&Platform::new("android")),
            PlatformProgress::Published
        );
        assert_eq!(fakes.upload.uploads().len(), 2);
    }

    #[tokio::test]
    async fn test_retried_publish_reuses_artifact_and_skips_done_uploads() {
        let dir = tempdir().unwrap();
        let fakes = Fakes::new();
        let steps = steps(&fakes, &["pc"], false);
        let cursor = memory_cursor();
        let publish = find(&steps, "publish:pc");

        fakes
            .upload
            .fail_on
            .lock()
            .unwrap()
            .push("beta".into());
        let mut ctx = context(dir.path(), cursor.clone(), &["pc"]);
        ctx.enter_step(&publish.name);
        assert!(publish.action.invoke(&mut ctx).await.is_err());
        assert_eq!(fakes.build.builds.load(Ordering::SeqCst), 1);
        assert_eq!(fakes.upload.uploads().len(), 1);

        // Next attempt in a new process: fresh context, same cursor store.
        fakes.upload.fail_on.lock().unwrap().clear();
        let mut ctx = context(dir.path(), cursor.clone(), &["pc"]);
        ctx.enter_step(&publish.name);
        publish.action.invoke(&mut ctx).await.unwrap();

        assert_eq!(fakes.build.builds.load(Ordering::SeqCst), 1);
        assert_eq!(
            fakes.upload.uploads(),
            vec![
                ("pc".to_string(), "main".to_string()),
                ("pc".to_string(), "beta".to_string()),
            ]
        );
        assert_eq!(fakes.login.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tampered_artifact_is_rebuilt() {
        let dir = tempdir().unwrap();
        let fakes = Fakes::new();
        let steps = steps(&fakes, &["pc"], false);
        let cursor = memory_cursor();
        let publish = find(&steps, "publish:pc");

        let mut ctx = context(dir.path(), cursor.clone(), &["pc"]);
        ctx.upload.enabled = false;
        ctx.enter_step(&publish.name);
        publish.action.invoke(&mut ctx).await.unwrap();

        std::fs::write(dir.path().join("out/pc/avatar.bin"), "tampered").unwrap();
        publish.action.invoke(&mut ctx).await.unwrap();
        assert_eq!(fakes.build.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_upload_disabled_stops_at_built() {
        let dir = tempdir().unwrap();
        let fakes = Fakes::new();
        let steps = steps(&fakes, &["pc"], false);
        let mut ctx = context(dir.path(), memory_cursor(), &["pc"]);
        ctx.upload.enabled = false;

        let publish = find(&steps, "publish:pc");
        ctx.enter_step(&publish.name);
        publish.action.invoke(&mut ctx).await.unwrap();

        assert_eq!(ctx.platform_state(&Platform::new("pc")), PlatformProgress::Built);
        assert!(fakes.upload.uploads().is_empty());
        assert_eq!(fakes.login.calls.load(Ordering::SeqCst), 0);
    }
}
