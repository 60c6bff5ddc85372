//! Step definitions for the stagehand orchestrator.
//!
//! This module provides:
//! - `InterruptionPolicy` deciding how a resumed run treats an interrupted step
//! - `StepAction`, the invocable part of a step (with or without context)
//! - `StepDescriptor`, the builder that step sources hand to the registry
//! - `Step`, the immutable, validated form the driver executes

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::context::BuildContext;
use crate::errors::StepValidationError;

/// How the resume trigger treats a step that was in flight when the host died.
///
/// | Policy     | On resume                                         |
/// |------------|---------------------------------------------------|
/// | `Retry`    | Re-run the same step, bounded by its retry limit  |
/// | `Continue` | Treat it as done and advance to the next step     |
/// | `Cancel`   | Abort the pipeline                                |
///
/// `Continue` fits steps whose side effect *is* the restart (a platform switch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptionPolicy {
    #[default]
    Retry,
    Continue,
    Cancel,
}

impl fmt::Display for InterruptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptionPolicy::Retry => write!(f, "retry"),
            InterruptionPolicy::Continue => write!(f, "continue"),
            InterruptionPolicy::Cancel => write!(f, "cancel"),
        }
    }
}

impl std::str::FromStr for InterruptionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "retry" => Ok(InterruptionPolicy::Retry),
            "continue" => Ok(InterruptionPolicy::Continue),
            "cancel" => Ok(InterruptionPolicy::Cancel),
            _ => anyhow::bail!(
                "Invalid interruption policy '{}'. Valid values: retry, continue, cancel",
                s
            ),
        }
    }
}

/// A step body that works on the shared build context.
#[async_trait]
pub trait ContextAction: Send + Sync {
    async fn run(&self, ctx: &mut BuildContext) -> Result<()>;
}

/// A step body that needs no context.
#[async_trait]
pub trait BareAction: Send + Sync {
    async fn run(&self) -> Result<()>;
}

struct FnAction<F>(F);

#[async_trait]
impl<F> ContextAction for FnAction<F>
where
    F: for<'a> Fn(&'a mut BuildContext) -> BoxFuture<'a, Result<()>> + Send + Sync,
{
    async fn run(&self, ctx: &mut BuildContext) -> Result<()> {
        (self.0)(ctx).await
    }
}

struct SyncFnAction<F>(F);

#[async_trait]
impl<F> ContextAction for SyncFnAction<F>
where
    F: Fn(&mut BuildContext) -> Result<()> + Send + Sync,
{
    async fn run(&self, ctx: &mut BuildContext) -> Result<()> {
        (self.0)(ctx)
    }
}

struct BareFnAction<F>(F);

#[async_trait]
impl<F> BareAction for BareFnAction<F>
where
    F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync,
{
    async fn run(&self) -> Result<()> {
        (self.0)().await
    }
}

/// The invocable part of a step.
///
/// The two shapes mirror the two accepted action signatures: one taking the
/// shared context, one taking nothing. Both may suspend.
#[derive(Clone)]
pub enum StepAction {
    WithContext(Arc<dyn ContextAction>),
    Bare(Arc<dyn BareAction>),
}

impl StepAction {
    pub fn with_context(action: impl ContextAction + 'static) -> Self {
        StepAction::WithContext(Arc::new(action))
    }

    /// Wrap an async closure over the context.
    ///
    /// ```ignore
    /// StepAction::from_fn(|ctx| Box::pin(async move {
    ///     ctx.metadata = Some("stamped".into());
    ///     Ok(())
    /// }))
    /// ```
    pub fn from_fn<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut BuildContext) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        StepAction::WithContext(Arc::new(FnAction(f)))
    }

    /// Wrap a closure that completes without suspending.
    pub fn from_sync_fn<F>(f: F) -> Self
    where
        F: Fn(&mut BuildContext) -> Result<()> + Send + Sync + 'static,
    {
        StepAction::WithContext(Arc::new(SyncFnAction(f)))
    }

    /// Wrap an async closure that ignores the context.
    pub fn bare_fn<F>(f: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        StepAction::Bare(Arc::new(BareFnAction(f)))
    }

    pub async fn invoke(&self, ctx: &mut BuildContext) -> Result<()> {
        match self {
            StepAction::WithContext(action) => action.run(ctx).await,
            StepAction::Bare(action) => action.run().await,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::WithContext(_) => "context",
            StepAction::Bare(_) => "bare",
        }
    }
}

impl fmt::Debug for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StepAction({})", self.kind())
    }
}

/// A step as registered by a step source, before validation.
#[derive(Debug, Clone)]
pub struct StepDescriptor {
    pub name: String,
    pub order: i32,
    pub policy: InterruptionPolicy,
    pub retry_limit: u32,
    pub action: Option<StepAction>,
}

impl StepDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order: 0,
            policy: InterruptionPolicy::default(),
            retry_limit: 0,
            action: None,
        }
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn policy(mut self, policy: InterruptionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn action(mut self, action: StepAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Check the descriptor on its own (uniqueness is the registry's job).
    pub fn validate(&self) -> Result<(), StepValidationError> {
        if self.name.trim().is_empty() {
            return Err(StepValidationError::BlankName);
        }
        if self
            .name
            .chars()
            .any(|c| c.is_whitespace() || c == '.')
        {
            return Err(StepValidationError::InvalidName {
                name: self.name.clone(),
            });
        }
        if self.action.is_none() {
            return Err(StepValidationError::MissingAction {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// A validated, immutable step in an assembled pipeline.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub order: i32,
    pub policy: InterruptionPolicy,
    pub retry_limit: u32,
    pub action: StepAction,
    /// Position in registration order, used to break `order` ties.
    pub discovery_index: usize,
}

impl Step {
    pub(crate) fn from_descriptor(
        descriptor: StepDescriptor,
        discovery_index: usize,
    ) -> Result<Self, StepValidationError> {
        descriptor.validate()?;
        let StepDescriptor {
            name,
            order,
            policy,
            retry_limit,
            action,
        } = descriptor;
        let action = action.ok_or_else(|| StepValidationError::MissingAction {
            name: name.clone(),
        })?;
        Ok(Self {
            name,
            order,
            policy,
            retry_limit,
            action,
            discovery_index,
        })
    }
}
