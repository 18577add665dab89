//! Continuation of failed tasks
//!
//! A failed task is put back at the stage whose attempt failed. A fan-out stage with
//! no segments to work on resumes one stage earlier so the segments are produced
//! again.

use crate::error::{EngineError, EngineResult};
use crate::machine::TaskSnapshot;
use crate::stage::{PipelineStage, StageKind};
use speech_tasks_storage::{StepRecord, StepStatus, TaskStore};
use tracing::info;

/// Stage a failed task should resume at
#[must_use]
pub fn resume_stage<S: PipelineStage>(steps: &[StepRecord], has_segments: bool) -> S {
    let failed = steps
        .iter()
        .rev()
        .find(|step| step.status == StepStatus::Error)
        .and_then(|step| S::parse(&step.stage))
        .filter(|stage| !stage.is_terminal())
        .unwrap_or_else(S::initial);

    if failed.kind() == StageKind::FanOut && !has_segments {
        return failed.predecessor().unwrap_or_else(S::initial);
    }
    failed
}

/// Prepare a task for another run
///
/// - unknown task: `None`
/// - finished task: returned unchanged
/// - unfinished task: stuck claims are cleared when `reset_claims` is set
/// - failed task: claims are cleared, then stage, error and progress counters are
///   reset in one update
pub async fn prepare_continuation<S: PipelineStage>(
    store: &dyn TaskStore,
    task_id: &str,
    reset_claims: bool,
) -> EngineResult<Option<TaskSnapshot<S>>> {
    let Some(record) = store.get_task(task_id).await? else {
        return Ok(None);
    };
    let stage = S::parse(&record.stage).ok_or_else(|| EngineError::UnknownStage {
        family: record.family.clone(),
        stage: record.stage.clone(),
    })?;

    if stage == S::DONE {
        return TaskSnapshot::from_record(&record).map(Some);
    }
    if stage != S::ERROR {
        if reset_claims {
            store.reset_stuck_segments(task_id).await?;
        }
        return TaskSnapshot::from_record(&record).map(Some);
    }

    let steps = store.list_steps(task_id).await?;
    let has_segments = !store.list_segments(task_id).await?.is_empty();
    let resume: S = resume_stage(&steps, has_segments);

    store.reset_stuck_segments(task_id).await?;
    let record = match store.reopen_task(task_id, resume.as_str()).await? {
        Some(reopened) => {
            info!(
                task_id,
                family = %reopened.family,
                stage = resume.as_str(),
                "failed task reopened"
            );
            reopened
        }
        None => match store.get_task(task_id).await? {
            Some(current) => current,
            None => return Ok(None),
        },
    };
    TaskSnapshot::from_record(&record).map(Some)
}
