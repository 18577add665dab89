//! Families driven end to end by the scheduler with in-process collaborators

use anyhow::Context;
use async_trait::async_trait;
use speech_tasks_engine::{SchedulerConfig, TaskFamily, TaskManager, TaskSnapshot};
use speech_tasks_families::collaborators::{
    CaptionSource, DialogueFormatter, MediaConverter, ObjectUploader, Punctuator,
    RecognitionPoll, SpeechRecognizer, StreamDownloader, StreamSelection, Transcriber,
    VideoMetadata,
};
use speech_tasks_families::{
    AudioFamily, AudioPayload, AudioServices, AudioStage, CaptionFamily, CaptionPayload,
    CaptionStage, DownloadFamily, DownloadPayload, DownloadStage, Phrase, Segmenter,
    SubscriptionFamily, SubscriptionPayload, SubscriptionStage, TranscriptionFamily,
    TranscriptionPayload, TranscriptionServices, TranscriptionStage,
};
use speech_tasks_storage::{MemoryTaskStore, NewTask, StageCommit, TaskStore};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent: None,
        scan_interval_ms: 50,
        stagnation_backoff_ms: 20,
    }
}

async fn wait_terminal<F: TaskFamily>(
    manager: &TaskManager<F>,
    task_id: &str,
) -> TaskSnapshot<F::Stage> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(snapshot) = manager.get_status(task_id).await.unwrap() {
                if snapshot.done {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task did not finish in time")
}

#[derive(Default)]
struct CopyConverter {
    calls: AtomicUsize,
}

#[async_trait]
impl MediaConverter for CopyConverter {
    async fn convert(&self, source: &Path, output_dir: &Path) -> anyhow::Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stem = source.file_stem().context("source has no file stem")?;
        let output = output_dir.join(format!("{}.opus", stem.to_string_lossy()));
        tokio::fs::copy(source, &output).await?;
        Ok(output)
    }
}

#[derive(Default)]
struct MemoryBucket {
    objects: Mutex<HashSet<(String, String)>>,
    uploads: AtomicUsize,
}

#[async_trait]
impl ObjectUploader for MemoryBucket {
    async fn exists(&self, bucket: &str, key: &str) -> anyhow::Result<bool> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .contains(&(bucket.to_string(), key.to_string())))
    }

    async fn upload(&self, _file: &Path, bucket: &str, key: &str) -> anyhow::Result<()> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()));
        Ok(())
    }

    fn object_uri(&self, bucket: &str, key: &str) -> String {
        format!("mem://{bucket}/{key}")
    }
}

struct ScriptedRecognizer {
    started: Mutex<Vec<String>>,
    running_polls: AtomicUsize,
    phrases: Vec<Phrase>,
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn start(&self, uri: &str) -> anyhow::Result<String> {
        self.started.lock().unwrap().push(uri.to_string());
        Ok("op-1".to_string())
    }

    async fn poll(&self, operation_id: &str) -> anyhow::Result<RecognitionPoll> {
        anyhow::ensure!(operation_id == "op-1", "unknown operation {operation_id}");
        let running = self.running_polls.load(Ordering::SeqCst);
        if running > 0 {
            self.running_polls.store(running - 1, Ordering::SeqCst);
            return Ok(RecognitionPoll::Running);
        }
        Ok(RecognitionPoll::Finished(self.phrases.clone()))
    }
}

/// Upper-cases text, appends a period and records the context it was given
#[derive(Default)]
struct UpperPunctuator {
    contexts: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl Punctuator for UpperPunctuator {
    async fn punctuate(&self, text: &str, context: Option<&str>) -> anyhow::Result<String> {
        self.contexts
            .lock()
            .unwrap()
            .push(context.map(str::to_string));
        Ok(format!("{}.", text.to_uppercase()))
    }
}

struct FixedTranscriber(Vec<Phrase>);

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, audio: &Path) -> anyhow::Result<Vec<Phrase>> {
        anyhow::ensure!(audio.exists(), "missing audio {}", audio.display());
        Ok(self.0.clone())
    }
}

struct SpeakerFormatter;

#[async_trait]
impl DialogueFormatter for SpeakerFormatter {
    async fn format(&self, transcript: &str) -> anyhow::Result<String> {
        Ok(format!("**Speaker 1:** {transcript}"))
    }
}

#[derive(Default)]
struct StaticCaptions {
    captions: Mutex<Vec<Phrase>>,
}

#[async_trait]
impl CaptionSource for StaticCaptions {
    async fn metadata(&self, video_id: &str) -> anyhow::Result<VideoMetadata> {
        Ok(VideoMetadata {
            title: format!("Video {video_id}"),
            ..VideoMetadata::default()
        })
    }

    async fn captions(&self, _video_id: &str, _language: &str) -> anyhow::Result<Vec<Phrase>> {
        Ok(self.captions.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct FileDownloader {
    downloads: AtomicUsize,
    merges: AtomicUsize,
}

#[async_trait]
impl StreamDownloader for FileDownloader {
    async fn download(
        &self,
        _video_id: &str,
        stream: &StreamSelection,
        destination: &Path,
    ) -> anyhow::Result<()> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(destination, stream.kind.as_bytes()).await?;
        Ok(())
    }

    async fn merge(&self, video: &Path, audio: &[PathBuf], output: &Path) -> anyhow::Result<()> {
        anyhow::ensure!(video.exists() && audio.iter().all(|a| a.exists()));
        self.merges.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(output, b"merged").await?;
        Ok(())
    }
}

fn stream(kind: &str, quality: Option<&str>, language: Option<&str>, container: &str) -> StreamSelection {
    StreamSelection {
        kind: kind.to_string(),
        quality: quality.map(str::to_string),
        language: language.map(str::to_string),
        container: container.to_string(),
    }
}

#[tokio::test]
async fn test_audio_waits_for_recognition_and_skips_existing_upload() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("lecture.mp3");
    tokio::fs::write(&source, b"audio").await.unwrap();

    let bucket = Arc::new(MemoryBucket::default());
    bucket
        .objects
        .lock()
        .unwrap()
        .insert(("speech".to_string(), "lecture.opus".to_string()));
    let recognizer = Arc::new(ScriptedRecognizer {
        started: Mutex::new(Vec::new()),
        running_polls: AtomicUsize::new(2),
        phrases: vec![
            Phrase::new("hello world", 0.0, 1.0),
            Phrase::new("second part", 3.0, 4.0),
        ],
    });
    let punctuator = Arc::new(UpperPunctuator::default());
    let converter = Arc::new(CopyConverter::default());

    let family = AudioFamily::new(
        AudioServices {
            converter: Arc::clone(&converter) as Arc<dyn MediaConverter>,
            uploader: Arc::clone(&bucket) as Arc<dyn ObjectUploader>,
            recognizer: Arc::clone(&recognizer) as Arc<dyn SpeechRecognizer>,
            punctuator: Arc::clone(&punctuator) as Arc<dyn Punctuator>,
        },
        dir.path().join("work"),
    );
    let store = Arc::new(MemoryTaskStore::new());
    let manager = TaskManager::new(family, Arc::clone(&store) as Arc<dyn TaskStore>, config());

    let task_id = manager
        .enqueue(AudioPayload::new("file-1", &source, "alice", "speech"), "alice")
        .await
        .unwrap();
    let snapshot = wait_terminal(&manager, &task_id).await;

    assert_eq!(snapshot.stage, AudioStage::Done);
    assert_eq!(snapshot.logical_key, "file-1:alice");
    assert_eq!(snapshot.result.as_deref(), Some("HELLO WORLD | SECOND PART."));
    assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(bucket.uploads.load(Ordering::SeqCst), 0);
    assert_eq!(
        *recognizer.started.lock().unwrap(),
        vec!["mem://speech/lecture.opus".to_string()]
    );
    assert_eq!(*punctuator.contexts.lock().unwrap(), vec![None]);

    let record = store.get_task(&task_id).await.unwrap().unwrap();
    let payload: AudioPayload = serde_json::from_value(record.payload).unwrap();
    assert_eq!(payload.operation_id.as_deref(), Some("op-1"));
    assert_eq!(payload.object_key.as_deref(), Some("lecture.opus"));

    let steps = manager.steps(&task_id).await.unwrap();
    let stages: Vec<&str> = steps.iter().map(|s| s.stage.as_str()).collect();
    assert_eq!(
        stages,
        vec![
            "converting",
            "uploading",
            "recognizing",
            "retrieving_result",
            "segmenting",
            "applying_punctuation"
        ]
    );
    manager.shutdown();
}

#[tokio::test]
async fn test_caption_segments_see_preceding_output() {
    let source = Arc::new(StaticCaptions::default());
    *source.captions.lock().unwrap() = vec![
        Phrase::new("one two", 0.0, 1.0),
        Phrase::new("three four", 1.1, 2.0),
        Phrase::new("five six", 2.1, 3.0),
    ];
    let punctuator = Arc::new(UpperPunctuator::default());
    let family = CaptionFamily::with_segmenter(
        Arc::clone(&source) as Arc<dyn CaptionSource>,
        Arc::clone(&punctuator) as Arc<dyn Punctuator>,
        Segmenter::default().with_max_words(2),
    );
    let manager = TaskManager::new(family, Arc::new(MemoryTaskStore::new()), config());

    let task_id = manager
        .enqueue(CaptionPayload::new("vid42", "en"), "bob")
        .await
        .unwrap();
    let snapshot = wait_terminal(&manager, &task_id).await;

    assert_eq!(snapshot.stage, CaptionStage::Done);
    assert_eq!(snapshot.logical_key, "vid42:en");
    assert_eq!(snapshot.segments_total, 3);
    assert_eq!(
        snapshot.result.as_deref(),
        Some("ONE TWO.\nTHREE FOUR.\nFIVE SIX.")
    );
    assert_eq!(
        *punctuator.contexts.lock().unwrap(),
        vec![
            None,
            Some("ONE TWO.".to_string()),
            Some("ONE TWO.\nTHREE FOUR.".to_string())
        ]
    );
    manager.shutdown();
}

#[tokio::test]
async fn test_caption_without_captions_fails_and_continues() {
    let source = Arc::new(StaticCaptions::default());
    let family = CaptionFamily::new(
        Arc::clone(&source) as Arc<dyn CaptionSource>,
        Arc::new(UpperPunctuator::default()),
    );
    let store = Arc::new(MemoryTaskStore::new());
    let manager = TaskManager::new(family, Arc::clone(&store) as Arc<dyn TaskStore>, config());

    let task_id = manager
        .enqueue(CaptionPayload::new("silent", "de"), "bob")
        .await
        .unwrap();
    let failed = wait_terminal(&manager, &task_id).await;
    assert_eq!(failed.stage, CaptionStage::Error);
    assert!(failed.error.as_deref().unwrap().contains("no de captions"));

    *source.captions.lock().unwrap() = vec![Phrase::new("hallo welt", 0.0, 1.0)];
    tokio::time::timeout(Duration::from_secs(10), async {
        while manager.in_flight_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let record = speech_tasks_families::continue_task(store.as_ref(), &task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.stage, "downloading_captions");
    assert!(!record.done);
    assert!(record.error.is_none());

    manager.process_queue_once().await.unwrap();
    let done = wait_terminal(&manager, &task_id).await;
    assert_eq!(done.stage, CaptionStage::Done);
    assert_eq!(done.result.as_deref(), Some("HALLO WELT."));
    manager.shutdown();
}

#[tokio::test]
async fn test_transcription_formats_markdown_result() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("interview.mp4");
    tokio::fs::write(&source, b"video").await.unwrap();

    let family = TranscriptionFamily::new(
        TranscriptionServices {
            converter: Arc::new(CopyConverter::default()),
            transcriber: Arc::new(FixedTranscriber(vec![Phrase::new("hello there", 0.0, 1.0)])),
            punctuator: Arc::new(UpperPunctuator::default()),
            formatter: Arc::new(SpeakerFormatter),
        },
        dir.path().join("work"),
    );
    let store = Arc::new(MemoryTaskStore::new());
    let manager = TaskManager::new(family, Arc::clone(&store) as Arc<dyn TaskStore>, config());

    let task_id = manager
        .enqueue(TranscriptionPayload::new(&source), "carol")
        .await
        .unwrap();
    let snapshot = wait_terminal(&manager, &task_id).await;

    assert_eq!(snapshot.stage, TranscriptionStage::Done);
    assert_eq!(snapshot.logical_key, source.to_string_lossy());
    assert_eq!(
        snapshot.result.as_deref(),
        Some("**Speaker 1:** HELLO THERE.")
    );

    let record = store.get_task(&task_id).await.unwrap().unwrap();
    let payload: TranscriptionPayload = serde_json::from_value(record.payload).unwrap();
    assert_eq!(payload.processed_text.as_deref(), Some("HELLO THERE."));
    assert!(payload.converted_path.unwrap().exists());
    manager.shutdown();
}

#[tokio::test]
async fn test_transcription_without_speech_fails_at_segmenting() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("silence.wav");
    tokio::fs::write(&source, b"").await.unwrap();

    let family = TranscriptionFamily::new(
        TranscriptionServices {
            converter: Arc::new(CopyConverter::default()),
            transcriber: Arc::new(FixedTranscriber(Vec::new())),
            punctuator: Arc::new(UpperPunctuator::default()),
            formatter: Arc::new(SpeakerFormatter),
        },
        dir.path().join("work"),
    );
    let manager = TaskManager::new(family, Arc::new(MemoryTaskStore::new()), config());

    let task_id = manager
        .enqueue(TranscriptionPayload::new(&source), "carol")
        .await
        .unwrap();
    let snapshot = wait_terminal(&manager, &task_id).await;

    assert_eq!(snapshot.stage, TranscriptionStage::Error);
    assert!(snapshot.error.as_deref().unwrap().contains("no blocks"));
    let steps = manager.steps(&task_id).await.unwrap();
    assert_eq!(steps.last().unwrap().stage, "segmenting");
    manager.shutdown();
}

#[tokio::test]
async fn test_download_reuses_streams_on_disk_and_merges() {
    let dir = tempfile::tempdir().unwrap();
    let save_dir = dir.path().join("downloads");
    tokio::fs::create_dir_all(&save_dir).await.unwrap();
    tokio::fs::write(save_dir.join("My Talk__audio_noQ_en.m4a"), b"audio")
        .await
        .unwrap();

    let downloader = Arc::new(FileDownloader::default());
    let manager = TaskManager::new(
        DownloadFamily::new(Arc::clone(&downloader) as Arc<dyn StreamDownloader>),
        Arc::new(MemoryTaskStore::new()),
        config(),
    );

    let payload = DownloadPayload {
        video_id: "abc123".to_string(),
        title: Some("My Talk".to_string()),
        streams: vec![
            stream("video", Some("1080p"), None, "mp4"),
            stream("audio", None, Some("en"), "m4a"),
        ],
        save_dir: save_dir.clone(),
        files: Vec::new(),
    };
    let task_id = manager.enqueue(payload, "dave").await.unwrap();
    let snapshot = wait_terminal(&manager, &task_id).await;

    assert_eq!(snapshot.stage, DownloadStage::Done);
    let merged = save_dir.join("My Talk.mp4");
    assert_eq!(snapshot.result.as_deref(), merged.to_str());
    assert!(merged.exists());
    assert_eq!(downloader.downloads.load(Ordering::SeqCst), 1);
    assert_eq!(downloader.merges.load(Ordering::SeqCst), 1);
    manager.shutdown();
}

#[tokio::test]
async fn test_download_muxed_stream_needs_no_merge() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = Arc::new(FileDownloader::default());
    let manager = TaskManager::new(
        DownloadFamily::new(Arc::clone(&downloader) as Arc<dyn StreamDownloader>),
        Arc::new(MemoryTaskStore::new()),
        config(),
    );

    let payload = DownloadPayload {
        video_id: "xyz".to_string(),
        title: None,
        streams: vec![stream("muxed", Some("720p"), None, "mp4")],
        save_dir: dir.path().to_path_buf(),
        files: Vec::new(),
    };
    let task_id = manager.enqueue(payload, "dave").await.unwrap();
    let snapshot = wait_terminal(&manager, &task_id).await;

    let expected = dir.path().join("xyz__muxed_720p_noLang.mp4");
    assert_eq!(snapshot.stage, DownloadStage::Done);
    assert_eq!(snapshot.result.as_deref(), expected.to_str());
    assert_eq!(downloader.merges.load(Ordering::SeqCst), 0);
    manager.shutdown();
}

#[tokio::test]
async fn test_subscription_document_is_punctuated_in_blocks() {
    let punctuator = Arc::new(UpperPunctuator::default());
    let family = SubscriptionFamily::with_segmenter(
        Arc::clone(&punctuator) as Arc<dyn Punctuator>,
        Segmenter::default().with_max_words(3),
    );
    let manager = TaskManager::new(family, Arc::new(MemoryTaskStore::new()), config());
    assert_eq!(manager.max_concurrent(), 5);

    let payload = SubscriptionPayload {
        subscription_id: "sub-1".to_string(),
        document_id: "doc-9".to_string(),
        text: "first line here\nsecond line there\n\nend".to_string(),
    };
    let task_id = manager.enqueue(payload, "erin").await.unwrap();
    let snapshot = wait_terminal(&manager, &task_id).await;

    assert_eq!(snapshot.stage, SubscriptionStage::Done);
    assert_eq!(snapshot.logical_key, "sub-1:doc-9");
    assert_eq!(snapshot.segments_total, 3);
    assert_eq!(
        snapshot.result.as_deref(),
        Some("FIRST LINE HERE.\nSECOND LINE THERE.\nEND.")
    );
    manager.shutdown();
}

#[tokio::test]
async fn test_continue_keeps_claims_of_running_task() {
    let store = MemoryTaskStore::new();
    store
        .insert_task(&NewTask {
            id: "sub-1".to_string(),
            family: "subscription".to_string(),
            logical_key: "s1:d1".to_string(),
            stage: "punctuating".to_string(),
            payload: serde_json::json!({
                "subscription_id": "s1",
                "document_id": "d1",
                "text": "eins\nzwei"
            }),
            created_by: "carol".to_string(),
        })
        .await
        .unwrap();
    store
        .commit_stage(
            "sub-1",
            &StageCommit {
                expected_stage: "punctuating".to_string(),
                next_stage: "punctuating".to_string(),
                done: false,
                payload: None,
                result: None,
                segments: Some(vec!["eins".to_string(), "zwei".to_string()]),
            },
        )
        .await
        .unwrap()
        .unwrap();
    // Owned by a scheduler in another process
    store.claim_next_segment("sub-1").await.unwrap().unwrap();

    let record = speech_tasks_families::continue_task(&store, "sub-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.stage, "punctuating");
    assert!(!record.done);

    let segments = store.list_segments("sub-1").await.unwrap();
    assert!(segments[0].is_processing);
    assert!(!segments[1].is_processing);
}

#[tokio::test]
async fn test_continue_unknown_task() {
    let store = MemoryTaskStore::new();
    assert!(speech_tasks_families::continue_task(&store, "missing")
        .await
        .unwrap()
        .is_none());
}
