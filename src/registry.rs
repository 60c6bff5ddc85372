//! Step discovery and pipeline assembly.
//!
//! Steps are contributed by [`StepSource`]s into a [`StepRegistry`]. Assembly
//! validates every descriptor, drops the invalid ones with a warning, and
//! orders the survivors by `(order, discovery_index)`. Given the same
//! sources and configuration, assembly yields the same list on every run,
//! which is what lets a persisted step index be meaningful after a restart.

use std::collections::{BTreeMap, HashSet};

use crate::config::{StepOverride, pattern_matches};
use crate::errors::StepValidationError;
use crate::logging::LOG_TAG;
use crate::step::{Step, StepDescriptor};

/// Something that contributes steps to a pipeline.
pub trait StepSource: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self, registry: &mut StepRegistry);
}

/// Collected step descriptors, in registration order.
#[derive(Debug, Default)]
pub struct StepRegistry {
    descriptors: Vec<StepDescriptor>,
    overrides: BTreeMap<String, StepOverride>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated from `sources`, in the order given.
    pub fn from_sources(sources: &[Box<dyn StepSource>]) -> Self {
        let mut registry = Self::new();
        for source in sources {
            registry.register_source(source.as_ref());
        }
        registry
    }

    pub fn register(&mut self, descriptor: StepDescriptor) -> &mut Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn register_source(&mut self, source: &dyn StepSource) -> &mut Self {
        let before = self.descriptors.len();
        source.register(self);
        tracing::debug!(
            source = source.name(),
            steps = self.descriptors.len() - before,
            "registered step source"
        );
        self
    }

    /// Glob-keyed retry/policy overrides applied at assembly.
    pub fn with_overrides(mut self, overrides: BTreeMap<String, StepOverride>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// The ordered, validated step list.
    pub fn assemble(&self) -> Vec<Step> {
        self.assemble_with_report().0
    }

    /// Like [`assemble`](Self::assemble), also returning what was rejected.
    pub fn assemble_with_report(&self) -> (Vec<Step>, Vec<StepValidationError>) {
        let mut steps = Vec::with_capacity(self.descriptors.len());
        let mut rejected = Vec::new();
        let mut seen = HashSet::new();

        for (discovery_index, descriptor) in self.descriptors.iter().enumerate() {
            let descriptor = self.apply_overrides(descriptor.clone());
            let result = Step::from_descriptor(descriptor, discovery_index).and_then(|step| {
                if seen.insert(step.name.clone()) {
                    Ok(step)
                } else {
                    Err(StepValidationError::DuplicateName { name: step.name })
                }
            });
            match result {
                Ok(step) => steps.push(step),
                Err(e) => {
                    tracing::warn!("{} Skipping step: {}", LOG_TAG, e);
                    rejected.push(e);
                }
            }
        }

        steps.sort_by_key(|s| (s.order, s.discovery_index));
        (steps, rejected)
    }

    fn apply_overrides(&self, mut descriptor: StepDescriptor) -> StepDescriptor {
        for (pattern, override_cfg) in &self.overrides {
            if !pattern_matches(pattern, &descriptor.name) {
                continue;
            }
            if let Some(limit) = override_cfg.retry_limit {
                descriptor.retry_limit = limit;
            }
            if let Some(policy) = override_cfg.policy {
                descriptor.policy = policy;
            }
        }
        descriptor
    }
}
