use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::context::BuildContext;
use crate::registry::{StepRegistry, StepSource};
use crate::services::{LoginService, UserIdentity};
use crate::step::{ContextAction, InterruptionPolicy, StepAction, StepDescriptor};

pub const LOGIN_STEP: &str = "login";

/// Contributes the `login` step.
pub struct AccountSteps {
    login: Arc<dyn LoginService>,
}

impl AccountSteps {
    pub fn new(login: Arc<dyn LoginService>) -> Self {
        Self { login }
    }
}

impl StepSource for AccountSteps {
    fn name(&self) -> &str {
        "account"
    }

    fn register(&self, registry: &mut StepRegistry) {
        registry.register(
            StepDescriptor::new(LOGIN_STEP)
                .order(0)
                .policy(InterruptionPolicy::Retry)
                .retry_limit(2)
                .action(StepAction::with_context(LoginAction {
                    login: self.login.clone(),
                })),
        );
    }
}

struct LoginAction {
    login: Arc<dyn LoginService>,
}

#[async_trait]
impl ContextAction for LoginAction {
    async fn run(&self, ctx: &mut BuildContext) -> Result<()> {
        let identity = self.login.login().await.context("Could not log in")?;
        ctx.identity = Some(identity);
        Ok(())
    }
}

/// The logged-in identity, logging in again if this process has none.
///
/// Identity lives only in the context, so a step running after a host
/// restart finds it missing even though `login` already succeeded.
pub async fn ensure_identity(
    ctx: &mut BuildContext,
    login: &dyn LoginService,
) -> Result<UserIdentity> {
    if let Some(identity) = &ctx.identity {
        return Ok(identity.clone());
    }
    tracing::debug!("no identity in this process, logging in again");
    let identity = login.login().await.context("Could not log in")?;
    ctx.identity = Some(identity.clone());
    Ok(identity)
}
