//! Uploaded audio recognition
//!
//! The file is converted, uploaded to object storage and handed to an asynchronous
//! recognizer. The finished transcript is segmented and every segment is punctuated
//! on its own.

use crate::collaborators::{
    MediaConverter, ObjectUploader, Punctuator, RecognitionPoll, SpeechRecognizer,
};
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
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioStage {
    Created,
    Converting,
    Uploading,
    Recognizing,
    RetrievingResult,
    Segmenting,
    ApplyingPunctuation,
    Done,
    Error,
}

impl PipelineStage for AudioStage {
    const ORDER: &'static [Self] = &[
        AudioStage::Created,
        AudioStage::Converting,
        AudioStage::Uploading,
        AudioStage::Recognizing,
        AudioStage::RetrievingResult,
        AudioStage::Segmenting,
        AudioStage::ApplyingPunctuation,
    ];
    const DONE: Self = AudioStage::Done;
    const ERROR: Self = AudioStage::Error;

    fn as_str(&self) -> &'static str {
        match self {
            AudioStage::Created => "created",
            AudioStage::Converting => "converting",
            AudioStage::Uploading => "uploading",
            AudioStage::Recognizing => "recognizing",
            AudioStage::RetrievingResult => "retrieving_result",
            AudioStage::Segmenting => "segmenting",
            AudioStage::ApplyingPunctuation => "applying_punctuation",
            AudioStage::Done => "done",
            AudioStage::Error => "error",
        }
    }

    fn kind(&self) -> StageKind {
        match self {
            AudioStage::Created | AudioStage::Done | AudioStage::Error => StageKind::Passthrough,
            AudioStage::ApplyingPunctuation => StageKind::FanOut,
            _ => StageKind::Step,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioPayload {
    pub audio_file_id: String,
    pub source_path: PathBuf,
    pub requested_by: String,
    pub bucket: String,
    #[serde(default)]
    pub converted_path: Option<PathBuf>,
    #[serde(default)]
    pub object_key: Option<String>,
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub phrases: Option<Vec<Phrase>>,
}

impl AudioPayload {
    pub fn new(
        audio_file_id: impl Into<String>,
        source_path: impl Into<PathBuf>,
        requested_by: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            audio_file_id: audio_file_id.into(),
            source_path: source_path.into(),
            requested_by: requested_by.into(),
            bucket: bucket.into(),
            ..Self::default()
        }
    }
}

/// External services used by [`AudioFamily`]
#[derive(Clone)]
pub struct AudioServices {
    pub converter: Arc<dyn MediaConverter>,
    pub uploader: Arc<dyn ObjectUploader>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub punctuator: Arc<dyn Punctuator>,
}

struct Convert {
    converter: Arc<dyn MediaConverter>,
    work_dir: PathBuf,
}

#[async_trait::async_trait]
impl StepExecutor<AudioPayload> for Convert {
    async fn run(
        &self,
        _task: &TaskRecord,
        payload: &mut AudioPayload,
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

struct Upload {
    uploader: Arc<dyn ObjectUploader>,
}

#[async_trait::async_trait]
impl StepExecutor<AudioPayload> for Upload {
    async fn run(
        &self,
        task: &TaskRecord,
        payload: &mut AudioPayload,
        _cancel: &CancellationToken,
    ) -> Result<StepOutcome, ExecutorError> {
        let converted = payload
            .converted_path
            .clone()
            .ok_or_else(|| ExecutorError::MissingOutput("converted audio".to_string()))?;
        let key = match &payload.object_key {
            Some(key) => key.clone(),
            None => converted
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| ExecutorError::failed("converted path has no file name"))?,
        };

        if self.uploader.exists(&payload.bucket, &key).await? {
            debug!(task_id = %task.id, key = %key, "object already uploaded");
        } else {
            self.uploader.upload(&converted, &payload.bucket, &key).await?;
            info!(task_id = %task.id, bucket = %payload.bucket, key = %key, "audio uploaded");
        }
        payload.object_key = Some(key);
        Ok(StepOutcome::complete())
    }
}

struct StartRecognition {
    uploader: Arc<dyn ObjectUploader>,
    recognizer: Arc<dyn SpeechRecognizer>,
}

#[async_trait::async_trait]
impl StepExecutor<AudioPayload> for StartRecognition {
    async fn run(
        &self,
        task: &TaskRecord,
        payload: &mut AudioPayload,
        _cancel: &CancellationToken,
    ) -> Result<StepOutcome, ExecutorError> {
        if payload.operation_id.is_some() {
            return Ok(StepOutcome::complete());
        }
        let key = payload
            .object_key
            .as_deref()
            .ok_or_else(|| ExecutorError::MissingOutput("uploaded object".to_string()))?;

        let uri = self.uploader.object_uri(&payload.bucket, key);
        let operation_id = self.recognizer.start(&uri).await?;
        info!(task_id = %task.id, operation_id = %operation_id, "recognition started");
        payload.operation_id = Some(operation_id);
        Ok(StepOutcome::complete())
    }
}

struct RetrieveResult {
    recognizer: Arc<dyn SpeechRecognizer>,
}

#[async_trait::async_trait]
impl StepExecutor<AudioPayload> for RetrieveResult {
    async fn run(
        &self,
        _task: &TaskRecord,
        payload: &mut AudioPayload,
        _cancel: &CancellationToken,
    ) -> Result<StepOutcome, ExecutorError> {
        if payload.phrases.is_some() {
            return Ok(StepOutcome::complete());
        }
        let operation_id = payload
            .operation_id
            .as_deref()
            .ok_or_else(|| ExecutorError::MissingOutput("recognition operation".to_string()))?;

        match self.recognizer.poll(operation_id).await? {
            RecognitionPoll::Running => Ok(StepOutcome::Pending),
            RecognitionPoll::Finished(phrases) => {
                payload.phrases = Some(phrases);
                Ok(StepOutcome::complete())
            }
        }
    }
}

fn recognized_phrases(payload: &AudioPayload) -> Option<&[Phrase]> {
    payload.phrases.as_deref()
}

/// Recognition of uploaded audio files
pub struct AudioFamily {
    convert: Convert,
    upload: Upload,
    start: StartRecognition,
    retrieve: RetrieveResult,
    segment: SegmentPhrases<AudioPayload>,
    punctuate: PunctuateSegments,
}

impl AudioFamily {
    pub fn new(services: AudioServices, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            convert: Convert {
                converter: services.converter,
                work_dir: work_dir.into(),
            },
            upload: Upload {
                uploader: Arc::clone(&services.uploader),
            },
            start: StartRecognition {
                uploader: services.uploader,
                recognizer: Arc::clone(&services.recognizer),
            },
            retrieve: RetrieveResult {
                recognizer: services.recognizer,
            },
            segment: SegmentPhrases::new(Segmenter::default(), recognized_phrases),
            punctuate: PunctuateSegments::without_context(services.punctuator),
        }
    }
}

impl TaskFamily for AudioFamily {
    type Stage = AudioStage;
    type Payload = AudioPayload;

    fn name(&self) -> &'static str {
        "audio"
    }

    fn logical_key(&self, payload: &AudioPayload) -> String {
        format!("{}:{}", payload.audio_file_id, payload.requested_by)
    }

    fn default_concurrency(&self) -> usize {
        10
    }

    fn step(&self, stage: AudioStage) -> Option<&dyn StepExecutor<AudioPayload>> {
        match stage {
            AudioStage::Converting => Some(&self.convert),
            AudioStage::Uploading => Some(&self.upload),
            AudioStage::Recognizing => Some(&self.start),
            AudioStage::RetrievingResult => Some(&self.retrieve),
            AudioStage::Segmenting => Some(&self.segment),
            _ => None,
        }
    }

    fn fan_out(&self, stage: AudioStage) -> Option<&dyn SegmentExecutor<AudioPayload>> {
        match stage {
            AudioStage::ApplyingPunctuation => Some(&self.punctuate),
            _ => None,
        }
    }
}
