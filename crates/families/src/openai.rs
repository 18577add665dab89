//! Local file transcription
//!
//! A media file is converted to audio, transcribed in one call, segmented, punctuated
//! segment by segment with context, and finally formatted as a markdown dialogue.
//! The markdown becomes the task result; the plain punctuated text stays in the
//! payload.

use crate::collaborators::{DialogueFormatter, MediaConverter, Punctuator, Transcriber};
use crate::punctuation::PunctuateSegments;
use crate::segmenter::{Phrase, Segmenter};
use crate::steps::{convert_once, SegmentPhrases};
use serde::{Deserialize, Serialize};
use speech_tasks_engine::{
    CancellationToken, ExecutorError, PipelineStage, SegmentExecutor, StageKind, StepExecutor,
    StepOutcome, TaskFamily,
};
use speech_tasks_storage::TaskRecord;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranscriptionStage {
    Created,
    Converting,
    Transcribing,
    Segmenting,
    ProcessingSegments,
    Formatting,
    Done,
    Error,
}

impl PipelineStage for TranscriptionStage {
    const ORDER: &'static [Self] = &[
        TranscriptionStage::Created,
        TranscriptionStage::Converting,
        TranscriptionStage::Transcribing,
        TranscriptionStage::Segmenting,
        TranscriptionStage::ProcessingSegments,
        TranscriptionStage::Formatting,
    ];
    const DONE: Self = TranscriptionStage::Done;
    const ERROR: Self = TranscriptionStage::Error;

    fn as_str(&self) -> &'static str {
        match self {
            TranscriptionStage::Created => "created",
            TranscriptionStage::Converting => "converting",
            TranscriptionStage::Transcribing => "transcribing",
            TranscriptionStage::Segmenting => "segmenting",
            TranscriptionStage::ProcessingSegments => "processing_segments",
            TranscriptionStage::Formatting => "formatting",
            TranscriptionStage::Done => "done",
            TranscriptionStage::Error => "error",
        }
    }

    fn kind(&self) -> StageKind {
        match self {
            TranscriptionStage::Created | TranscriptionStage::Done | TranscriptionStage::Error => {
                StageKind::Passthrough
            }
            TranscriptionStage::ProcessingSegments => StageKind::FanOut,
            _ => StageKind::Step,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionPayload {
    pub source_path: PathBuf,
    #[serde(default)]
    pub converted_path: Option<PathBuf>,
    #[serde(default)]
    pub phrases: Option<Vec<Phrase>>,
    #[serde(default)]
    pub processed_text: Option<String>,
}

impl TranscriptionPayload {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            ..Self::default()
        }
    }
}

/// External services used by [`TranscriptionFamily`]
#[derive(Clone)]
pub struct TranscriptionServices {
    pub converter: Arc<dyn MediaConverter>,
    pub transcriber: Arc<dyn Transcriber>,
    pub punctuator: Arc<dyn Punctuator>,
    pub formatter: Arc<dyn DialogueFormatter>,
}

struct Convert {
    converter: Arc<dyn MediaConverter>,
    work_dir: PathBuf,
}

#[async_trait::async_trait]
impl StepExecutor<TranscriptionPayload> for Convert {
    async fn run(
        &self,
        _task: &TaskRecord,
        payload: &mut TranscriptionPayload,
        _cancel: &CancellationToken,
    ) -> Result<StepOutcome, ExecutorError> {
        let converted = convert_once(
            self.converter.as_ref(),
            payload.converted_path.as_deref(),
            &payload.source_path,
            &self.work_dir,
        )
        .await?;
        payload.converted_path = Some(converted);
        Ok(StepOutcome::complete())
    }
}

struct Transcribe {
    transcriber: Arc<dyn Transcriber>,
}

#[async_trait::async_trait]
impl StepExecutor<TranscriptionPayload> for Transcribe {
    async fn run(
        &self,
        task: &TaskRecord,
        payload: &mut TranscriptionPayload,
        _cancel: &CancellationToken,
    ) -> Result<StepOutcome, ExecutorError> {
        if payload.phrases.is_some() {
            return Ok(StepOutcome::complete());
        }
        let audio = payload
            .converted_path
            .clone()
            .ok_or_else(|| ExecutorError::MissingOutput("converted audio".to_string()))?;
        if !tokio::fs::try_exists(&audio).await? {
            return Err(ExecutorError::failed("converted audio file not found"));
        }

        let phrases = self.transcriber.transcribe(&audio).await?;
        info!(task_id = %task.id, phrases = phrases.len(), "audio transcribed");
        payload.phrases = Some(phrases);
        Ok(StepOutcome::complete())
    }
}

struct Format {
    formatter: Arc<dyn DialogueFormatter>,
}

#[async_trait::async_trait]
impl StepExecutor<TranscriptionPayload> for Format {
    async fn run(
        &self,
        task: &TaskRecord,
        payload: &mut TranscriptionPayload,
        _cancel: &CancellationToken,
    ) -> Result<StepOutcome, ExecutorError> {
        if payload.processed_text.is_none() {
            payload.processed_text = task.result.clone();
        }
        let transcript = payload
            .processed_text
            .as_deref()
            .ok_or_else(|| ExecutorError::MissingOutput("punctuated transcript".to_string()))?;

        let markdown = self.formatter.format(transcript).await?;
        Ok(StepOutcome::with_result(markdown))
    }
}

fn transcribed_phrases(payload: &TranscriptionPayload) -> Option<&[Phrase]> {
    payload.phrases.as_deref()
}

/// Transcription of local media files
pub struct TranscriptionFamily {
    convert: Convert,
    transcribe: Transcribe,
    segment: SegmentPhrases<TranscriptionPayload>,
    punctuate: PunctuateSegments,
    format: Format,
}

impl TranscriptionFamily {
    pub fn new(services: TranscriptionServices, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            convert: Convert {
                converter: services.converter,
                work_dir: work_dir.into(),
            },
            transcribe: Transcribe {
                transcriber: services.transcriber,
            },
            segment: SegmentPhrases::new(Segmenter::default(), transcribed_phrases)
                .require_blocks(),
            punctuate: PunctuateSegments::new(services.punctuator),
            format: Format {
                formatter: services.formatter,
            },
        }
    }
}

impl TaskFamily for TranscriptionFamily {
    type Stage = TranscriptionStage;
    type Payload = TranscriptionPayload;

    fn name(&self) -> &'static str {
        "openai"
    }

    fn logical_key(&self, payload: &TranscriptionPayload) -> String {
        payload.source_path.to_string_lossy().into_owned()
    }

    fn default_concurrency(&self) -> usize {
        3
    }

    fn step(&self, stage: TranscriptionStage) -> Option<&dyn StepExecutor<TranscriptionPayload>> {
        match stage {
            TranscriptionStage::Converting => Some(&self.convert),
            TranscriptionStage::Transcribing => Some(&self.transcribe),
            TranscriptionStage::Segmenting => Some(&self.segment),
            TranscriptionStage::Formatting => Some(&self.format),
            _ => None,
        }
    }

    fn fan_out(
        &self,
        stage: TranscriptionStage,
    ) -> Option<&dyn SegmentExecutor<TranscriptionPayload>> {
        match stage {
            TranscriptionStage::ProcessingSegments => Some(&self.punctuate),
            _ => None,
        }
    }
}
