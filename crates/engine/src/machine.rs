//! Stage state machine
//!
//! [`StageMachine::advance`] performs one unit of work for a task: a passthrough
//! transition, one step executor call, or one segment of a fan-out stage. Every
//! write is a single atomic store operation guarded by the stage the task was read
//! at, so a second scheduler racing on the same task cannot double-transition it.

use crate::claimer::{Release, SegmentClaimer};
use crate::error::{EngineError, EngineResult, ExecutorError};
use crate::executor::{SegmentFallback, StepOutcome};
use crate::family::TaskFamily;
use crate::stage::{PipelineStage, StageKind};
use chrono::{DateTime, Utc};
use speech_tasks_storage::{StageCommit, StepStatus, TaskRecord, TaskStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Caller-facing view of a task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot<S> {
    pub id: String,
    pub family: String,
    pub logical_key: String,
    pub stage: S,
    pub done: bool,
    pub error: Option<String>,
    pub segments_total: i32,
    pub segments_processed: i32,
    pub result: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl<S: PipelineStage> TaskSnapshot<S> {
    pub fn from_record(record: &TaskRecord) -> EngineResult<Self> {
        let stage = S::parse(&record.stage).ok_or_else(|| EngineError::UnknownStage {
            family: record.family.clone(),
            stage: record.stage.clone(),
        })?;
        Ok(Self {
            id: record.id.clone(),
            family: record.family.clone(),
            logical_key: record.logical_key.clone(),
            stage,
            done: record.done,
            error: record.error.clone(),
            segments_total: record.segments_total,
            segments_processed: record.segments_processed,
            result: record.result.clone(),
            created_by: record.created_by.clone(),
            created_at: record.created_at,
            modified_at: record.modified_at,
        })
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

pub struct StageMachine<F: TaskFamily> {
    family: Arc<F>,
    store: Arc<dyn TaskStore>,
    claimer: SegmentClaimer,
}

impl<F: TaskFamily> Clone for StageMachine<F> {
    fn clone(&self) -> Self {
        Self {
            family: Arc::clone(&self.family),
            store: Arc::clone(&self.store),
            claimer: self.claimer.clone(),
        }
    }
}

impl<F: TaskFamily> StageMachine<F> {
    pub fn new(family: Arc<F>, store: Arc<dyn TaskStore>) -> Self {
        let claimer = SegmentClaimer::new(Arc::clone(&store));
        Self {
            family,
            store,
            claimer,
        }
    }

    #[must_use]
    pub fn claimer(&self) -> &SegmentClaimer {
        &self.claimer
    }

    /// Perform one unit of work for a task and return its committed state
    ///
    /// Terminal tasks are returned unchanged. Executor failures move the task to the
    /// error stage; store failures are returned without touching the task.
    pub async fn advance(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<TaskSnapshot<F::Stage>> {
        let record = self.load(task_id).await?;
        let stage = self.parse_stage(&record)?;
        if stage.is_terminal() {
            return TaskSnapshot::from_record(&record);
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        match stage.kind() {
            StageKind::Passthrough => self.transition(&record, stage, None, None, None).await,
            StageKind::Step => self.run_step(record, stage, cancel).await,
            StageKind::FanOut => self.run_fan_out(record, stage, cancel).await,
        }
    }

    async fn load(&self, task_id: &str) -> EngineResult<TaskRecord> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    fn parse_stage(&self, record: &TaskRecord) -> EngineResult<F::Stage> {
        F::Stage::parse(&record.stage).ok_or_else(|| EngineError::UnknownStage {
            family: self.family.name().to_string(),
            stage: record.stage.clone(),
        })
    }

    async fn run_step(
        &self,
        record: TaskRecord,
        stage: F::Stage,
        cancel: &CancellationToken,
    ) -> EngineResult<TaskSnapshot<F::Stage>> {
        let step = self.store.open_step(&record.id, stage.as_str()).await?;

        let Some(executor) = self.family.step(stage) else {
            let message = format!("no executor registered for stage {}", stage.as_str());
            return self.fail(&record, step.id, &message).await;
        };
        let mut payload: F::Payload = match serde_json::from_value(record.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => return self.fail(&record, step.id, &format!("invalid payload: {e}")).await,
        };

        debug!(task_id = %record.id, stage = stage.as_str(), "running stage executor");
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
            outcome = executor.run(&record, &mut payload, cancel) => outcome,
        };

        match outcome {
            Ok(StepOutcome::Pending) => {
                debug!(task_id = %record.id, stage = stage.as_str(), "stage pending");
                TaskSnapshot::from_record(&record)
            }
            Ok(StepOutcome::Complete { segments, result }) => {
                let payload = serde_json::to_value(&payload)?;
                let snapshot = self
                    .transition(&record, stage, Some(payload), result, segments)
                    .await?;
                self.store
                    .finish_step(step.id, StepStatus::Completed, None)
                    .await?;
                Ok(snapshot)
            }
            Err(ExecutorError::Cancelled) => Err(EngineError::Cancelled),
            Err(e) => self.fail(&record, step.id, &e.to_string()).await,
        }
    }

    async fn run_fan_out(
        &self,
        record: TaskRecord,
        stage: F::Stage,
        cancel: &CancellationToken,
    ) -> EngineResult<TaskSnapshot<F::Stage>> {
        let step = self.store.open_step(&record.id, stage.as_str()).await?;

        let Some(executor) = self.family.fan_out(stage) else {
            let message = format!("no segment executor registered for stage {}", stage.as_str());
            return self.fail(&record, step.id, &message).await;
        };

        let Some(segment) = self.claimer.claim_next(&record.id).await? else {
            let Some(segments) = self.claimer.finished_segments(&record.id).await? else {
                // A claim is still outstanding
                return TaskSnapshot::from_record(&record);
            };
            let result = segments
                .iter()
                .map(|s| s.output())
                .collect::<Vec<_>>()
                .join(self.family.segment_separator());
            let snapshot = self
                .transition(&record, stage, None, Some(result), None)
                .await?;
            self.store
                .finish_step(step.id, StepStatus::Completed, None)
                .await?;
            return Ok(snapshot);
        };

        let payload: F::Payload = match serde_json::from_value(record.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                self.claimer.release(&segment, Release::Abandon).await?;
                return self.fail(&record, step.id, &format!("invalid payload: {e}")).await;
            }
        };
        let context = self.claimer.context_for(&segment).await?;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ExecutorError::Cancelled),
            outcome = executor.process(&record, &payload, &segment, &context, cancel) => outcome,
        };

        let release = match outcome {
            Ok(text) => Release::Processed(text),
            Err(ExecutorError::Cancelled) => {
                self.claimer.release(&segment, Release::Abandon).await?;
                return Err(EngineError::Cancelled);
            }
            Err(e) => match executor.fallback(&e) {
                SegmentFallback::UseOriginalText => {
                    warn!(
                        task_id = %record.id,
                        order = segment.order,
                        error = %e,
                        "segment failed, keeping original text"
                    );
                    Release::Degraded
                }
                SegmentFallback::FailTask => {
                    self.claimer.release(&segment, Release::Abandon).await?;
                    let message = format!("segment {} failed: {e}", segment.order);
                    return self.fail(&record, step.id, &message).await;
                }
            },
        };

        match self.claimer.release(&segment, release).await? {
            Some(updated) => TaskSnapshot::from_record(&updated),
            None => TaskSnapshot::from_record(&self.load(&record.id).await?),
        }
    }

    async fn transition(
        &self,
        record: &TaskRecord,
        stage: F::Stage,
        payload: Option<serde_json::Value>,
        result: Option<String>,
        segments: Option<Vec<String>>,
    ) -> EngineResult<TaskSnapshot<F::Stage>> {
        let next = stage.successor().unwrap_or(F::Stage::DONE);
        let commit = StageCommit {
            expected_stage: stage.as_str().to_string(),
            next_stage: next.as_str().to_string(),
            done: next == F::Stage::DONE,
            payload,
            result,
            segments,
        };

        match self.store.commit_stage(&record.id, &commit).await? {
            Some(updated) => {
                info!(
                    task_id = %record.id,
                    family = self.family.name(),
                    from = stage.as_str(),
                    to = next.as_str(),
                    "stage transition"
                );
                TaskSnapshot::from_record(&updated)
            }
            None => {
                debug!(task_id = %record.id, stage = stage.as_str(), "stage already moved on");
                TaskSnapshot::from_record(&self.load(&record.id).await?)
            }
        }
    }

    async fn fail(
        &self,
        record: &TaskRecord,
        step_id: i64,
        message: &str,
    ) -> EngineResult<TaskSnapshot<F::Stage>> {
        error!(
            task_id = %record.id,
            family = self.family.name(),
            stage = %record.stage,
            error = message,
            "stage failed"
        );
        let failed = self
            .store
            .fail_task(&record.id, F::Stage::ERROR.as_str(), message)
            .await?;
        self.store
            .finish_step(step_id, StepStatus::Error, Some(message))
            .await?;

        match failed {
            Some(updated) => TaskSnapshot::from_record(&updated),
            None => TaskSnapshot::from_record(&self.load(&record.id).await?),
        }
    }
}
