//! Published caption punctuation
//!
//! Fetches a video's captions in one language, groups them into blocks and punctuates
//! each block with the already punctuated text before it as context.

use crate::collaborators::{CaptionSource, Punctuator, VideoMetadata};
use crate::punctuation::PunctuateSegments;
use crate::segmenter::{Phrase, Segmenter};
use crate::steps::SegmentPhrases;
use serde::{Deserialize, Serialize};
use speech_tasks_engine::{
    CancellationToken, ExecutorError, PipelineStage, SegmentExecutor, StageKind, StepExecutor,
    StepOutcome, TaskFamily,
};
use speech_tasks_storage::TaskRecord;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptionStage {
    Created,
    FetchingMetadata,
    DownloadingCaptions,
    SegmentingCaptions,
    ApplyingPunctuationSegment,
    Done,
    Error,
}

impl PipelineStage for CaptionStage {
    const ORDER: &'static [Self] = &[
        CaptionStage::Created,
        CaptionStage::FetchingMetadata,
        CaptionStage::DownloadingCaptions,
        CaptionStage::SegmentingCaptions,
        CaptionStage::ApplyingPunctuationSegment,
    ];
    const DONE: Self = CaptionStage::Done;
    const ERROR: Self = CaptionStage::Error;

    fn as_str(&self) -> &'static str {
        match self {
            CaptionStage::Created => "created",
            CaptionStage::FetchingMetadata => "fetching_metadata",
            CaptionStage::DownloadingCaptions => "downloading_captions",
            CaptionStage::SegmentingCaptions => "segmenting_captions",
            CaptionStage::ApplyingPunctuationSegment => "applying_punctuation_segment",
            CaptionStage::Done => "done",
            CaptionStage::Error => "error",
        }
    }

    fn kind(&self) -> StageKind {
        match self {
            CaptionStage::FetchingMetadata
            | CaptionStage::DownloadingCaptions
            | CaptionStage::SegmentingCaptions => StageKind::Step,
            CaptionStage::ApplyingPunctuationSegment => StageKind::FanOut,
            _ => StageKind::Passthrough,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptionPayload {
    pub video_id: String,
    pub language: String,
    #[serde(default)]
    pub metadata: Option<VideoMetadata>,
    #[serde(default)]
    pub captions: Option<Vec<Phrase>>,
}

impl CaptionPayload {
    pub fn new(video_id: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            language: language.into(),
            ..Self::default()
        }
    }
}

struct FetchMetadata {
    source: Arc<dyn CaptionSource>,
}

#[async_trait::async_trait]
impl StepExecutor<CaptionPayload> for FetchMetadata {
    async fn run(
        &self,
        task: &TaskRecord,
        payload: &mut CaptionPayload,
        _cancel: &CancellationToken,
    ) -> Result<StepOutcome, ExecutorError> {
        if payload.metadata.is_none() {
            let metadata = self.source.metadata(&payload.video_id).await?;
            info!(task_id = %task.id, title = %metadata.title, "video metadata fetched");
            payload.metadata = Some(metadata);
        }
        Ok(StepOutcome::complete())
    }
}

struct DownloadCaptions {
    source: Arc<dyn CaptionSource>,
}

#[async_trait::async_trait]
impl StepExecutor<CaptionPayload> for DownloadCaptions {
    async fn run(
        &self,
        task: &TaskRecord,
        payload: &mut CaptionPayload,
        _cancel: &CancellationToken,
    ) -> Result<StepOutcome, ExecutorError> {
        if payload.captions.is_none() {
            let captions = self
                .source
                .captions(&payload.video_id, &payload.language)
                .await?;
            if captions.is_empty() {
                return Err(ExecutorError::failed(format!(
                    "no {} captions for video {}",
                    payload.language, payload.video_id
                )));
            }
            info!(task_id = %task.id, count = captions.len(), "captions downloaded");
            payload.captions = Some(captions);
        }
        Ok(StepOutcome::complete())
    }
}

fn downloaded_captions(payload: &CaptionPayload) -> Option<&[Phrase]> {
    payload.captions.as_deref()
}

/// Punctuation of published video captions
pub struct CaptionFamily {
    metadata: FetchMetadata,
    download: DownloadCaptions,
    segment: SegmentPhrases<CaptionPayload>,
    punctuate: PunctuateSegments,
}

impl CaptionFamily {
    pub fn new(source: Arc<dyn CaptionSource>, punctuator: Arc<dyn Punctuator>) -> Self {
        Self::with_segmenter(source, punctuator, Segmenter::default())
    }

    pub fn with_segmenter(
        source: Arc<dyn CaptionSource>,
        punctuator: Arc<dyn Punctuator>,
        segmenter: Segmenter,
    ) -> Self {
        Self {
            metadata: FetchMetadata {
                source: Arc::clone(&source),
            },
            download: DownloadCaptions { source },
            segment: SegmentPhrases::new(segmenter, downloaded_captions),
            punctuate: PunctuateSegments::new(punctuator),
        }
    }
}

impl TaskFamily for CaptionFamily {
    type Stage = CaptionStage;
    type Payload = CaptionPayload;

    fn name(&self) -> &'static str {
        "caption"
    }

    fn logical_key(&self, payload: &CaptionPayload) -> String {
        format!("{}:{}", payload.video_id, payload.language)
    }

    fn default_concurrency(&self) -> usize {
        30
    }

    fn step(&self, stage: CaptionStage) -> Option<&dyn StepExecutor<CaptionPayload>> {
        match stage {
            CaptionStage::FetchingMetadata => Some(&self.metadata),
            CaptionStage::DownloadingCaptions => Some(&self.download),
            CaptionStage::SegmentingCaptions => Some(&self.segment),
            _ => None,
        }
    }

    fn fan_out(&self, stage: CaptionStage) -> Option<&dyn SegmentExecutor<CaptionPayload>> {
        match stage {
            CaptionStage::ApplyingPunctuationSegment => Some(&self.punctuate),
            _ => None,
        }
    }
}
