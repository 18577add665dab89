//! Executor contracts
//!
//! Executors hold the domain logic of a stage. The engine owns persistence: an
//! executor mutates the typed payload it is handed and reports an outcome, and the
//! engine commits both in one atomic stage transition.

use crate::error::ExecutorError;
use speech_tasks_storage::{SegmentRecord, TaskRecord};
use tokio_util::sync::CancellationToken;

/// Result of one step executor call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The stage finished; the mutated payload is committed and the task advances
    Complete {
        /// Replaces the task's segments in the same commit
        segments: Option<Vec<String>>,
        /// Replaces the task's result text
        result: Option<String>,
    },
    /// Waiting on an external operation; nothing is written
    Pending,
}

impl StepOutcome {
    #[must_use]
    pub fn complete() -> Self {
        Self::Complete {
            segments: None,
            result: None,
        }
    }

    #[must_use]
    pub fn with_segments(segments: Vec<String>) -> Self {
        Self::Complete {
            segments: Some(segments),
            result: None,
        }
    }

    #[must_use]
    pub fn with_result(result: impl Into<String>) -> Self {
        Self::Complete {
            segments: None,
            result: Some(result.into()),
        }
    }
}

/// Executor for a [`StageKind::Step`](crate::StageKind::Step) stage
#[async_trait::async_trait]
pub trait StepExecutor<P: Send + Sync>: Send + Sync {
    /// Run the stage once
    ///
    /// Must be safe to call again after a crash: check `payload` for output of an
    /// earlier attempt before redoing external work.
    async fn run(
        &self,
        task: &TaskRecord,
        payload: &mut P,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, ExecutorError>;
}

/// Processed output of the segments preceding the one being worked on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentContext {
    pub previous: Vec<String>,
}

impl SegmentContext {
    /// The last `count` processed outputs, oldest first
    #[must_use]
    pub fn tail(&self, count: usize) -> &[String] {
        let start = self.previous.len().saturating_sub(count);
        &self.previous[start..]
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}

/// What happens to a segment whose executor failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentFallback {
    /// Mark the segment processed with its input text
    #[default]
    UseOriginalText,
    /// Release the claim and fail the whole task
    FailTask,
}

/// Executor for a [`StageKind::FanOut`](crate::StageKind::FanOut) stage
#[async_trait::async_trait]
pub trait SegmentExecutor<P: Send + Sync>: Send + Sync {
    async fn process(
        &self,
        task: &TaskRecord,
        payload: &P,
        segment: &SegmentRecord,
        context: &SegmentContext,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError>;

    fn fallback(&self, _error: &ExecutorError) -> SegmentFallback {
        SegmentFallback::UseOriginalText
    }
}
