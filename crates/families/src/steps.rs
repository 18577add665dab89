//! Step executors and helpers shared between families

use crate::collaborators::MediaConverter;
use crate::segmenter::{Phrase, Segmenter};
use speech_tasks_engine::{CancellationToken, ExecutorError, StepExecutor, StepOutcome};
use speech_tasks_storage::TaskRecord;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reads the recognized phrases out of a family payload
pub type PhraseSource<P> = fn(&P) -> Option<&[Phrase]>;

/// Splits the recognized phrases into the task's segments
pub struct SegmentPhrases<P> {
    segmenter: Segmenter,
    source: PhraseSource<P>,
    require_blocks: bool,
    _payload: PhantomData<fn(&P)>,
}

impl<P> SegmentPhrases<P> {
    pub fn new(segmenter: Segmenter, source: PhraseSource<P>) -> Self {
        Self {
            segmenter,
            source,
            require_blocks: false,
            _payload: PhantomData,
        }
    }

    /// Fail the stage when segmentation yields nothing
    #[must_use]
    pub fn require_blocks(mut self) -> Self {
        self.require_blocks = true;
        self
    }
}

#[async_trait::async_trait]
impl<P: Send + Sync> StepExecutor<P> for SegmentPhrases<P> {
    async fn run(
        &self,
        task: &TaskRecord,
        payload: &mut P,
        _cancel: &CancellationToken,
    ) -> Result<StepOutcome, ExecutorError> {
        let phrases = (self.source)(payload)
            .ok_or_else(|| ExecutorError::MissingOutput("recognized phrases".to_string()))?;
        let blocks = self.segmenter.segment(phrases);
        if blocks.is_empty() && self.require_blocks {
            return Err(ExecutorError::failed("segmenting produced no blocks"));
        }

        debug!(task_id = %task.id, phrases = phrases.len(), blocks = blocks.len(), "segmented transcript");
        Ok(StepOutcome::with_segments(blocks))
    }
}

/// Convert `source` unless an earlier attempt already left a converted file
pub async fn convert_once(
    converter: &dyn MediaConverter,
    converted: Option<&Path>,
    source: &Path,
    output_dir: &Path,
) -> Result<PathBuf, ExecutorError> {
    if let Some(path) = converted {
        if tokio::fs::try_exists(path).await? {
            debug!(path = %path.display(), "reusing converted file");
            return Ok(path.to_path_buf());
        }
    }
    if !tokio::fs::try_exists(source).await? {
        return Err(ExecutorError::failed(format!(
            "source file not found: {}",
            source.display()
        )));
    }
    tokio::fs::create_dir_all(output_dir).await?;
    Ok(converter.convert(source, output_dir).await?)
}
