use crate::context::BuildContext;
use crate::cursor::{Cursor, NOT_ATTEMPTED};
use crate::errors::PipelineError;
use crate::logging::LOG_TAG;
use crate::step::{InterruptionPolicy, Step};

use super::driver::{PipelineDriver, PipelineOutcome};

/// What to do with a run found in progress at process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Re-enter the driver at this index.
    RunFrom { index: usize },
    /// Abort: the interrupted step's policy is cancel.
    Cancel { step: String },
}

/// Apply the interrupted step's policy to a cursor.
///
/// A cursor whose retry count is still `-1` names a step that was about to
/// start but never did, so it runs from that index whatever its policy.
pub fn decide(steps: &[Step], cursor: &Cursor) -> Result<ResumeDecision, PipelineError> {
    let index = cursor.step_index;

    if cursor.retry_count == NOT_ATTEMPTED && index <= steps.len() {
        return Ok(ResumeDecision::RunFrom { index });
    }

    let step = steps.get(index).ok_or(PipelineError::UnknownStep {
        index,
        step_count: steps.len(),
    })?;

    Ok(match step.policy {
        InterruptionPolicy::Retry => ResumeDecision::RunFrom { index },
        InterruptionPolicy::Continue => ResumeDecision::RunFrom { index: index + 1 },
        InterruptionPolicy::Cancel => ResumeDecision::Cancel {
            step: step.name.clone(),
        },
    })
}

/// Re-enter an in-progress run. `None` when there is nothing to resume.
///
/// Any failure along the way aborts the pipeline rather than surfacing to
/// the caller.
pub async fn resume(driver: &PipelineDriver, ctx: &mut BuildContext) -> Option<PipelineOutcome> {
    let cursor = match driver.cursor().load() {
        Ok(Some(cursor)) => cursor,
        Ok(None) => {
            tracing::debug!("no run in progress");
            return None;
        }
        Err(e) => return Some(driver.abort(e.into())),
    };

    let decision = match decide(driver.steps(), &cursor) {
        Ok(decision) => decision,
        Err(e) => return Some(driver.abort(e)),
    };

    match decision {
        ResumeDecision::RunFrom { index } => {
            let step_name = driver
                .steps()
                .get(cursor.step_index)
                .map(|s| s.name.as_str())
                .unwrap_or("<end>");
            tracing::info!(
                "{} Resuming run {} at step {} (interrupted in '{}')",
                LOG_TAG,
                cursor.run_id,
                index,
                step_name
            );
            Some(driver.run(ctx, index).await)
        }
        ResumeDecision::Cancel { step } => {
            Some(driver.abort(PipelineError::Cancelled { step }))
        }
    }
}
