//! External services the family executors call
//!
//! Implementations live with the host application; tests use in-process stubs.

use crate::segmenter::Phrase;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Transcodes media files
#[async_trait]
pub trait MediaConverter: Send + Sync {
    /// Convert `source` into a file under `output_dir` and return its path
    async fn convert(&self, source: &Path, output_dir: &Path) -> anyhow::Result<PathBuf>;
}

/// Object storage bucket
#[async_trait]
pub trait ObjectUploader: Send + Sync {
    async fn exists(&self, bucket: &str, key: &str) -> anyhow::Result<bool>;

    async fn upload(&self, file: &Path, bucket: &str, key: &str) -> anyhow::Result<()>;

    /// Address the recognizer reads the object from
    fn object_uri(&self, bucket: &str, key: &str) -> String;
}

/// Status of a long-running recognition operation
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionPoll {
    Running,
    Finished(Vec<Phrase>),
}

/// Asynchronous speech recognition
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Start recognition of an uploaded object; returns the operation id
    async fn start(&self, uri: &str) -> anyhow::Result<String>;

    async fn poll(&self, operation_id: &str) -> anyhow::Result<RecognitionPoll>;
}

/// Synchronous transcription of a local audio file
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> anyhow::Result<Vec<Phrase>>;
}

/// Restores punctuation and casing in recognized text
#[async_trait]
pub trait Punctuator: Send + Sync {
    /// `context` holds already punctuated text that precedes `text`
    async fn punctuate(&self, text: &str, context: Option<&str>) -> anyhow::Result<String>;
}

/// Turns a transcript into a speaker-labelled markdown dialogue
#[async_trait]
pub trait DialogueFormatter: Send + Sync {
    async fn format(&self, transcript: &str) -> anyhow::Result<String>;
}

/// Video metadata needed by the caption pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    pub channel: Option<String>,
    pub published_at: Option<String>,
}

/// Source of published captions
#[async_trait]
pub trait CaptionSource: Send + Sync {
    async fn metadata(&self, video_id: &str) -> anyhow::Result<VideoMetadata>;

    async fn captions(&self, video_id: &str, language: &str) -> anyhow::Result<Vec<Phrase>>;
}

/// One stream selected for download
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamSelection {
    /// `audio`, `video` or `muxed`
    pub kind: String,
    pub quality: Option<String>,
    pub language: Option<String>,
    pub container: String,
}

/// Video hosting stream access
#[async_trait]
pub trait StreamDownloader: Send + Sync {
    async fn download(
        &self,
        video_id: &str,
        stream: &StreamSelection,
        destination: &Path,
    ) -> anyhow::Result<()>;

    /// Mux one video stream with audio tracks into `output`
    async fn merge(&self, video: &Path, audio: &[PathBuf], output: &Path) -> anyhow::Result<()>;
}
