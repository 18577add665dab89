//! Deterministic task family shared by the engine integration tests

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use speech_tasks_engine::{
    CancellationToken, ExecutorError, PipelineStage, SegmentContext, SegmentExecutor,
    SegmentFallback, StageKind, StepExecutor, StepOutcome, TaskFamily, TaskManager, TaskSnapshot,
};
use speech_tasks_storage::{MemoryTaskStore, SegmentRecord, TaskRecord};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleStage {
    Created,
    Fetching,
    Polishing,
    Done,
    Error,
}

impl PipelineStage for SampleStage {
    const ORDER: &'static [Self] = &[
        SampleStage::Created,
        SampleStage::Fetching,
        SampleStage::Polishing,
    ];
    const DONE: Self = SampleStage::Done;
    const ERROR: Self = SampleStage::Error;

    fn as_str(&self) -> &'static str {
        match self {
            SampleStage::Created => "created",
            SampleStage::Fetching => "fetching",
            SampleStage::Polishing => "polishing",
            SampleStage::Done => "done",
            SampleStage::Error => "error",
        }
    }

    fn kind(&self) -> StageKind {
        match self {
            SampleStage::Fetching => StageKind::Step,
            SampleStage::Polishing => StageKind::FanOut,
            _ => StageKind::Passthrough,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplePayload {
    pub key: String,
    pub segments: usize,
    #[serde(default)]
    pub failing_segment: Option<i32>,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub fetched: bool,
}

impl SamplePayload {
    pub fn new(key: &str, segments: usize) -> Self {
        Self {
            key: key.to_string(),
            segments,
            ..Self::default()
        }
    }
}

/// Records executor activity so tests can assert on it
#[derive(Default)]
pub struct Probe {
    active: Mutex<HashSet<String>>,
    pub overlap: AtomicBool,
    pub fetch_calls: AtomicUsize,
    segment_calls: Mutex<HashMap<(String, i32), usize>>,
    failures_left: AtomicUsize,
}

impl Probe {
    fn enter(&self, task_id: &str) {
        if !self.active.lock().unwrap().insert(task_id.to_string()) {
            self.overlap.store(true, Ordering::SeqCst);
        }
    }

    fn exit(&self, task_id: &str) {
        self.active.lock().unwrap().remove(task_id);
    }

    pub fn segment_calls(&self, task_id: &str, order: i32) -> usize {
        self.segment_calls
            .lock()
            .unwrap()
            .get(&(task_id.to_string(), order))
            .copied()
            .unwrap_or(0)
    }

    /// Limit how many times the failing segment actually fails
    pub fn fail_times(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }
}

pub struct FetchStep {
    probe: Arc<Probe>,
    delay: Duration,
    outage: Option<Arc<MemoryTaskStore>>,
    outage_fired: AtomicBool,
}

#[async_trait::async_trait]
impl StepExecutor<SamplePayload> for FetchStep {
    async fn run(
        &self,
        task: &TaskRecord,
        payload: &mut SamplePayload,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, ExecutorError> {
        self.probe.enter(&task.id);
        self.probe.fetch_calls.fetch_add(1, Ordering::SeqCst);

        tokio::select! {
            () = cancel.cancelled() => {
                self.probe.exit(&task.id);
                return Err(ExecutorError::Cancelled);
            }
            () = tokio::time::sleep(self.delay) => {}
        }
        self.probe.exit(&task.id);

        if let Some(store) = &self.outage {
            if !self.outage_fired.swap(true, Ordering::SeqCst) {
                store.set_available(false);
            }
        }
        if payload.pending {
            return Ok(StepOutcome::Pending);
        }

        payload.fetched = true;
        Ok(StepOutcome::with_segments(
            (0..payload.segments).map(|i| format!("segment {i}")).collect(),
        ))
    }
}

pub struct PolishSegments {
    probe: Arc<Probe>,
    fallback: SegmentFallback,
}

#[async_trait::async_trait]
impl SegmentExecutor<SamplePayload> for PolishSegments {
    async fn process(
        &self,
        task: &TaskRecord,
        payload: &SamplePayload,
        segment: &SegmentRecord,
        context: &SegmentContext,
        _cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        self.probe.enter(&task.id);
        *self
            .probe
            .segment_calls
            .lock()
            .unwrap()
            .entry((task.id.clone(), segment.order))
            .or_default() += 1;
        tokio::task::yield_now().await;
        self.probe.exit(&task.id);

        if usize::try_from(segment.order).unwrap() != context.previous.len() {
            return Err(ExecutorError::failed("context out of order"));
        }
        if payload.failing_segment == Some(segment.order) {
            let remaining = self.probe.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.probe.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(ExecutorError::failed(format!(
                    "cannot polish segment {}",
                    segment.order
                )));
            }
        }
        Ok(segment.text.to_uppercase())
    }

    fn fallback(&self, _error: &ExecutorError) -> SegmentFallback {
        self.fallback
    }
}

pub struct SampleFamily {
    fetch: FetchStep,
    polish: PolishSegments,
    concurrency: usize,
}

impl SampleFamily {
    pub fn new(probe: Arc<Probe>) -> Self {
        probe.fail_times(usize::MAX);
        Self {
            fetch: FetchStep {
                probe: Arc::clone(&probe),
                delay: Duration::from_millis(5),
                outage: None,
                outage_fired: AtomicBool::new(false),
            },
            polish: PolishSegments {
                probe,
                fallback: SegmentFallback::UseOriginalText,
            },
            concurrency: 4,
        }
    }

    pub fn with_fallback(mut self, fallback: SegmentFallback) -> Self {
        self.polish.fallback = fallback;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.fetch.delay = delay;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Switch the store off right after the first fetch
    pub fn with_outage(mut self, store: Arc<MemoryTaskStore>) -> Self {
        self.fetch.outage = Some(store);
        self
    }
}

impl TaskFamily for SampleFamily {
    type Stage = SampleStage;
    type Payload = SamplePayload;

    fn name(&self) -> &'static str {
        "sample"
    }

    fn logical_key(&self, payload: &SamplePayload) -> String {
        payload.key.clone()
    }

    fn default_concurrency(&self) -> usize {
        self.concurrency
    }

    fn step(&self, stage: SampleStage) -> Option<&dyn StepExecutor<SamplePayload>> {
        match stage {
            SampleStage::Fetching => Some(&self.fetch),
            _ => None,
        }
    }

    fn fan_out(&self, stage: SampleStage) -> Option<&dyn SegmentExecutor<SamplePayload>> {
        match stage {
            SampleStage::Polishing => Some(&self.polish),
            _ => None,
        }
    }
}

/// Poll until the task is terminal
pub async fn wait_terminal(
    manager: &TaskManager<SampleFamily>,
    task_id: &str,
) -> TaskSnapshot<SampleStage> {
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

/// Poll until no worker owns any task
pub async fn wait_idle(manager: &TaskManager<SampleFamily>) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while manager.in_flight_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("workers did not drain in time");
}

/// Poll until `condition` holds
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
