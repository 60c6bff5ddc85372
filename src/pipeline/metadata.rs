use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::context::BuildContext;
use crate::registry::{StepRegistry, StepSource};
use crate::services::MetadataSink;
use crate::step::{ContextAction, InterruptionPolicy, StepAction, StepDescriptor};

pub const APPLY_METADATA_STEP: &str = "apply-metadata";

/// Contributes the `apply-metadata` step.
pub struct MetadataSteps {
    sink: Arc<dyn MetadataSink>,
}

impl MetadataSteps {
    pub fn new(sink: Arc<dyn MetadataSink>) -> Self {
        Self { sink }
    }
}

impl StepSource for MetadataSteps {
    fn name(&self) -> &str {
        "metadata"
    }

    fn register(&self, registry: &mut StepRegistry) {
        registry.register(
            StepDescriptor::new(APPLY_METADATA_STEP)
                .order(10)
                .policy(InterruptionPolicy::Retry)
                .retry_limit(1)
                .action(StepAction::with_context(ApplyMetadata {
                    sink: self.sink.clone(),
                })),
        );
    }
}

struct ApplyMetadata {
    sink: Arc<dyn MetadataSink>,
}

#[async_trait]
impl ContextAction for ApplyMetadata {
    async fn run(&self, ctx: &mut BuildContext) -> Result<()> {
        match &ctx.metadata {
            Some(payload) => self.sink.apply(payload).await,
            None => tracing::debug!("no metadata payload configured"),
        }
        Ok(())
    }
}
