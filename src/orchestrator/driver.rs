use chrono::Utc;
use uuid::Uuid;

use crate::context::BuildContext;
use crate::cursor::{Cursor, CursorManager, NOT_ATTEMPTED};
use crate::errors::PipelineError;
use crate::logging::LOG_TAG;
use crate::step::{InterruptionPolicy, Step};

/// How a pipeline run ended.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Every step from the start index onward succeeded.
    Completed { steps_run: usize },
    /// The run hit a fatal error. The cursor has been cleared.
    Aborted(PipelineError),
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineOutcome::Completed { .. })
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            PipelineOutcome::Completed { .. } => None,
            PipelineOutcome::Aborted(e) => Some(e),
        }
    }

    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> u8 {
        if self.is_success() { 0 } else { 1 }
    }
}

/// Executes an assembled step list against the durable cursor.
///
/// The cursor is written before each action starts, so a kill at any point
/// inside an action leaves it naming the step that was in flight.
pub struct PipelineDriver {
    steps: Vec<Step>,
    cursor: CursorManager,
}

impl PipelineDriver {
    pub fn new(steps: Vec<Step>, cursor: CursorManager) -> Self {
        Self { steps, cursor }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn cursor(&self) -> &CursorManager {
        &self.cursor
    }

    /// Run steps from `start_index` to the end.
    ///
    /// Never returns an error: every failure becomes
    /// [`PipelineOutcome::Aborted`] with the cursor cleared.
    pub async fn run(&self, ctx: &mut BuildContext, start_index: usize) -> PipelineOutcome {
        match self.execute(ctx, start_index).await {
            Ok(steps_run) => match self.cursor.clear() {
                Ok(()) => {
                    tracing::info!("{} Pipeline completed ({} steps run)", LOG_TAG, steps_run);
                    PipelineOutcome::Completed { steps_run }
                }
                Err(e) => self.abort(e.into()),
            },
            Err(e) => self.abort(e),
        }
    }

    /// Terminal failure: log, clear the cursor, report.
    pub(crate) fn abort(&self, error: PipelineError) -> PipelineOutcome {
        tracing::error!("{} Pipeline aborted: {}", LOG_TAG, error);
        if let Err(e) = self.cursor.clear() {
            tracing::warn!("{} Could not clear cursor after abort: {}", LOG_TAG, e);
        }
        PipelineOutcome::Aborted(error)
    }

    async fn execute(
        &self,
        ctx: &mut BuildContext,
        start_index: usize,
    ) -> Result<usize, PipelineError> {
        let existing = self.cursor.load()?;
        let run_id = existing
            .as_ref()
            .map(|c| c.run_id)
            .filter(|id| !id.is_nil())
            .unwrap_or_else(Uuid::new_v4);
        let started_at = existing
            .as_ref()
            .map(|c| c.started_at)
            .unwrap_or_else(Utc::now);

        let total = self.steps.len();
        let mut steps_run = 0;

        for index in start_index..total {
            let step = &self.steps[index];
            let previous = match &existing {
                Some(c) if index == start_index && c.step_index == index => c.retry_count,
                _ => NOT_ATTEMPTED,
            };
            let retry_count = previous + 1;

            self.cursor.save(&Cursor {
                step_index: index,
                retry_count,
                run_id,
                started_at,
            })?;

            if step.policy == InterruptionPolicy::Retry && retry_count > i64::from(step.retry_limit)
            {
                return Err(PipelineError::RetriesExhausted {
                    step: step.name.clone(),
                    attempts: u32::try_from(retry_count).unwrap_or(u32::MAX),
                    limit: step.retry_limit,
                });
            }

            let attempt = retry_count + 1;
            if retry_count > 0 {
                tracing::info!(
                    step = %step.name,
                    index,
                    attempt,
                    %run_id,
                    "{} [{}/{}] Retrying step '{}' (retry {} of {})",
                    LOG_TAG,
                    index + 1,
                    total,
                    step.name,
                    retry_count,
                    step.retry_limit
                );
            } else {
                tracing::info!(
                    step = %step.name,
                    index,
                    attempt,
                    %run_id,
                    "{} [{}/{}] Running step '{}'",
                    LOG_TAG,
                    index + 1,
                    total,
                    step.name
                );
            }

            ctx.enter_step(&step.name);
            let result = step.action.invoke(ctx).await;
            ctx.leave_step();
            if let Err(source) = result {
                tracing::error!(
                    step = %step.name,
                    index,
                    attempt,
                    %run_id,
                    "{} Step '{}' failed",
                    LOG_TAG,
                    step.name
                );
                return Err(PipelineError::StepFailed {
                    step: step.name.clone(),
                    source,
                });
            }

            self.cursor.save(&Cursor {
                step_index: index + 1,
                retry_count: NOT_ATTEMPTED,
                run_id,
                started_at,
            })?;
            self.cursor.progress(&step.name).clear()?;
            steps_run += 1;
            tracing::info!(
                step = %step.name,
                index,
                attempt,
                %run_id,
                "{} Step '{}' completed",
                LOG_TAG,
                step.name
            );
        }

        Ok(steps_run)
    }
}
