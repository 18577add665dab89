//! Video stream download
//!
//! Downloads the selected streams of a video into a directory and muxes a separate
//! video stream with its audio tracks. The task result is the path of the final file.

use crate::collaborators::{StreamDownloader, StreamSelection};
use serde::{Deserialize, Serialize};
use speech_tasks_engine::{
    CancellationToken, ExecutorError, PipelineStage, SegmentExecutor, StageKind, StepExecutor,
    StepOutcome, TaskFamily,
};
use speech_tasks_storage::TaskRecord;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const MAX_FILE_STEM: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadStage {
    Created,
    Downloading,
    Merging,
    Done,
    Error,
}

impl PipelineStage for DownloadStage {
    const ORDER: &'static [Self] = &[
        DownloadStage::Created,
        DownloadStage::Downloading,
        DownloadStage::Merging,
    ];
    const DONE: Self = DownloadStage::Done;
    const ERROR: Self = DownloadStage::Error;

    fn as_str(&self) -> &'static str {
        match self {
            DownloadStage::Created => "created",
            DownloadStage::Downloading => "downloading",
            DownloadStage::Merging => "merging",
            DownloadStage::Done => "done",
            DownloadStage::Error => "error",
        }
    }

    fn kind(&self) -> StageKind {
        match self {
            DownloadStage::Downloading | DownloadStage::Merging => StageKind::Step,
            _ => StageKind::Passthrough,
        }
    }
}

/// A stream that is on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadedFile {
    pub kind: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPayload {
    pub video_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub streams: Vec<StreamSelection>,
    pub save_dir: PathBuf,
    #[serde(default)]
    pub files: Vec<DownloadedFile>,
}

impl DownloadPayload {
    fn file_stem(&self) -> String {
        safe_file_stem(self.title.as_deref().unwrap_or(&self.video_id))
    }
}

/// Replace characters that are not allowed in file names and cap the length
#[must_use]
pub fn safe_file_stem(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => ' ',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let stem: String = collapsed.chars().take(MAX_FILE_STEM).collect();
    let stem = stem.trim().trim_end_matches('.');
    if stem.is_empty() {
        "untitled".to_string()
    } else {
        stem.to_string()
    }
}

fn stream_file_name(stem: &str, stream: &StreamSelection) -> String {
    format!(
        "{stem}__{}_{}_{}.{}",
        stream.kind,
        stream.quality.as_deref().unwrap_or("noQ"),
        stream.language.as_deref().unwrap_or("noLang"),
        stream.container
    )
}

struct Download {
    downloader: Arc<dyn StreamDownloader>,
}

#[async_trait::async_trait]
impl StepExecutor<DownloadPayload> for Download {
    async fn run(
        &self,
        task: &TaskRecord,
        payload: &mut DownloadPayload,
        _cancel: &CancellationToken,
    ) -> Result<StepOutcome, ExecutorError> {
        if payload.streams.is_empty() {
            return Err(ExecutorError::failed("no streams selected"));
        }
        tokio::fs::create_dir_all(&payload.save_dir).await?;

        let stem = payload.file_stem();
        let mut files = Vec::with_capacity(payload.streams.len());
        for stream in &payload.streams {
            let path = payload.save_dir.join(stream_file_name(&stem, stream));
            if tokio::fs::try_exists(&path).await? {
                debug!(task_id = %task.id, path = %path.display(), "stream already on disk");
            } else {
                self.downloader
                    .download(&payload.video_id, stream, &path)
                    .await?;
                info!(task_id = %task.id, kind = %stream.kind, path = %path.display(), "stream downloaded");
            }
            files.push(DownloadedFile {
                kind: stream.kind.clone(),
                path,
            });
        }

        payload.files = files;
        Ok(StepOutcome::complete())
    }
}

struct Merge {
    downloader: Arc<dyn StreamDownloader>,
}

impl Merge {
    async fn merged_path(&self, payload: &DownloadPayload) -> Result<PathBuf, ExecutorError> {
        if let [only] = payload.files.as_slice() {
            return Ok(only.path.clone());
        }

        let video = payload
            .files
            .iter()
            .find(|f| f.kind == "video" || f.kind == "muxed");
        let audio: Vec<PathBuf> = payload
            .files
            .iter()
            .filter(|f| f.kind == "audio")
            .map(|f| f.path.clone())
            .collect();

        let Some(video) = video else {
            return audio
                .into_iter()
                .next()
                .ok_or_else(|| ExecutorError::MissingOutput("downloaded streams".to_string()));
        };
        if audio.is_empty() || video.kind == "muxed" {
            return Ok(video.path.clone());
        }

        let output = payload.save_dir.join(format!("{}.mp4", payload.file_stem()));
        if !tokio::fs::try_exists(&output).await? {
            self.downloader.merge(&video.path, &audio, &output).await?;
        }
        Ok(output)
    }
}

#[async_trait::async_trait]
impl StepExecutor<DownloadPayload> for Merge {
    async fn run(
        &self,
        task: &TaskRecord,
        payload: &mut DownloadPayload,
        _cancel: &CancellationToken,
    ) -> Result<StepOutcome, ExecutorError> {
        let merged = self.merged_path(payload).await?;
        info!(task_id = %task.id, path = %merged.display(), "download ready");
        Ok(StepOutcome::with_result(display_path(&merged)))
    }
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Download of selected video streams
pub struct DownloadFamily {
    download: Download,
    merge: Merge,
}

impl DownloadFamily {
    pub fn new(downloader: Arc<dyn StreamDownloader>) -> Self {
        Self {
            download: Download {
                downloader: Arc::clone(&downloader),
            },
            merge: Merge { downloader },
        }
    }
}

impl TaskFamily for DownloadFamily {
    type Stage = DownloadStage;
    type Payload = DownloadPayload;

    fn name(&self) -> &'static str {
        "youtube"
    }

    fn logical_key(&self, payload: &DownloadPayload) -> String {
        payload.video_id.clone()
    }

    fn default_concurrency(&self) -> usize {
        3
    }

    fn step(&self, stage: DownloadStage) -> Option<&dyn StepExecutor<DownloadPayload>> {
        match stage {
            DownloadStage::Downloading => Some(&self.download),
            DownloadStage::Merging => Some(&self.merge),
            _ => None,
        }
    }

    fn fan_out(&self, _stage: DownloadStage) -> Option<&dyn SegmentExecutor<DownloadPayload>> {
        None
    }
}
