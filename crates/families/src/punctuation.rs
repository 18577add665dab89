//! Per-segment punctuation executor shared by the fan-out stages

use crate::collaborators::Punctuator;
use speech_tasks_engine::{CancellationToken, ExecutorError, SegmentContext, SegmentExecutor};
use speech_tasks_storage::{SegmentRecord, TaskRecord};
use std::sync::Arc;

/// Punctuates one segment, optionally with the text that precedes it
///
/// Failures fall back to the segment's original text.
pub struct PunctuateSegments {
    punctuator: Arc<dyn Punctuator>,
    with_context: bool,
}

impl PunctuateSegments {
    pub fn new(punctuator: Arc<dyn Punctuator>) -> Self {
        Self {
            punctuator,
            with_context: true,
        }
    }

    /// Punctuate every segment in isolation
    pub fn without_context(punctuator: Arc<dyn Punctuator>) -> Self {
        Self {
            punctuator,
            with_context: false,
        }
    }
}

#[async_trait::async_trait]
impl<P: Send + Sync> SegmentExecutor<P> for PunctuateSegments {
    async fn process(
        &self,
        _task: &TaskRecord,
        _payload: &P,
        segment: &SegmentRecord,
        context: &SegmentContext,
        _cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        let joined;
        let context = if self.with_context && !context.is_empty() {
            joined = context.previous.join("\n");
            Some(joined.as_str())
        } else {
            None
        };
        Ok(self.punctuator.punctuate(&segment.text, context).await?)
    }
}
