//! Pipeline execution.
//!
//! - `driver` runs an assembled step list and owns the cursor discipline
//! - `resume` decides, at process start, where an interrupted run re-enters
//!
//! [`Pipeline`] ties them to a freshly assembled step list and exposes the
//! two entry points: start a new run, or resume the one in progress.

pub mod driver;
pub mod resume;

pub use driver::{PipelineDriver, PipelineOutcome};
pub use resume::{ResumeDecision, decide};

use crate::context::BuildContext;
use crate::cursor::CursorManager;
use crate::errors::StepValidationError;
use crate::logging::LOG_TAG;
use crate::registry::StepRegistry;
use crate::step::Step;

pub struct Pipeline {
    driver: PipelineDriver,
    rejected: Vec<StepValidationError>,
}

impl Pipeline {
    /// Assemble the registry's steps against `cursor`.
    pub fn assemble(registry: &StepRegistry, cursor: CursorManager) -> Self {
        let (steps, rejected) = registry.assemble_with_report();
        Self {
            driver: PipelineDriver::new(steps, cursor),
            rejected,
        }
    }

    pub fn steps(&self) -> &[Step] {
        self.driver.steps()
    }

    /// Descriptors dropped during assembly.
    pub fn rejected(&self) -> &[StepValidationError] {
        &self.rejected
    }

    pub fn cursor(&self) -> &CursorManager {
        self.driver.cursor()
    }

    /// Discard any run in progress and start from the first step.
    pub async fn start(&self, ctx: &mut BuildContext) -> PipelineOutcome {
        if let Err(e) = self.cursor().clear() {
            return self.driver.abort(e.into());
        }
        tracing::info!(
            "{} Starting pipeline with {} steps",
            LOG_TAG,
            self.steps().len()
        );
        self.driver.run(ctx, 0).await
    }

    /// Continue the run in progress, if there is one.
    pub async fn resume(&self, ctx: &mut BuildContext) -> Option<PipelineOutcome> {
        resume::resume(&self.driver, ctx).await
    }
}
