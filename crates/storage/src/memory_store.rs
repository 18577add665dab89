//! In-process task store
//!
//! Keeps every record behind one async mutex, so each trait method is atomic in the
//! same way a single `PostgreSQL` transaction is. Used by tests and by hosts that
//! do not need durability across restarts.

use crate::{
    next_modified_at, InsertOutcome, NewTask, SegmentRecord, StageCommit, StepRecord, StepStatus,
    StorageError, StorageResult, TaskRecord, TaskStore,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

struct StoredTask {
    seq: u64,
    record: TaskRecord,
}

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<String, StoredTask>,
    segments: HashMap<i64, SegmentRecord>,
    steps: Vec<StepRecord>,
    next_task_seq: u64,
    next_segment_id: i64,
    next_step_id: i64,
}

impl MemoryState {
    fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskRecord> {
        self.tasks.get_mut(task_id).map(|stored| &mut stored.record)
    }

    fn count_segments(&self, task_id: &str) -> (i32, i32) {
        let mut total = 0;
        let mut processed = 0;
        for segment in self.segments.values().filter(|s| s.task_id == task_id) {
            total += 1;
            if segment.is_processed {
                processed += 1;
            }
        }
        (total, processed)
    }

    fn sorted_tasks<'a>(&'a self, filter: impl Fn(&TaskRecord) -> bool) -> Vec<&'a StoredTask> {
        let mut tasks: Vec<&StoredTask> = self
            .tasks
            .values()
            .filter(|stored| filter(&stored.record))
            .collect();
        tasks.sort_by_key(|stored| stored.seq);
        tasks
    }
}

/// Task store held in process memory
#[derive(Default)]
pub struct MemoryTaskStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryTaskStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle availability; while unavailable every operation fails with
    /// [`StorageError::Unavailable`]
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "memory store switched off".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TaskStore for MemoryTaskStore {
    async fn init_schema(&self) -> StorageResult<()> {
        self.ensure_available()
    }

    async fn insert_task(&self, task: &NewTask) -> StorageResult<InsertOutcome> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;

        if let Some(existing) = state.tasks.values().find(|stored| {
            !stored.record.done
                && stored.record.family == task.family
                && stored.record.logical_key == task.logical_key
        }) {
            return Ok(InsertOutcome::Existing(existing.record.clone()));
        }
        if state.tasks.contains_key(&task.id) {
            return Err(StorageError::InvalidRecord(format!(
                "duplicate task id {}",
                task.id
            )));
        }

        let now = Utc::now();
        let record = TaskRecord {
            id: task.id.clone(),
            family: task.family.clone(),
            logical_key: task.logical_key.clone(),
            stage: task.stage.clone(),
            done: false,
            error: None,
            segments_total: 0,
            segments_processed: 0,
            payload: task.payload.clone(),
            result: None,
            created_by: task.created_by.clone(),
            created_at: now,
            modified_at: now,
        };
        let seq = state.next_task_seq;
        state.next_task_seq += 1;
        state.tasks.insert(
            task.id.clone(),
            StoredTask {
                seq,
                record: record.clone(),
            },
        );
        Ok(InsertOutcome::Created(record))
    }

    async fn get_task(&self, task_id: &str) -> StorageResult<Option<TaskRecord>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.tasks.get(task_id).map(|stored| stored.record.clone()))
    }

    async fn list_tasks(&self, family: Option<&str>) -> StorageResult<Vec<TaskRecord>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut tasks: Vec<TaskRecord> = state
            .sorted_tasks(|record| family.map_or(true, |f| record.family == f))
            .into_iter()
            .map(|stored| stored.record.clone())
            .collect();
        tasks.reverse();
        Ok(tasks)
    }

    async fn list_pending(&self, family: &str) -> StorageResult<Vec<TaskRecord>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .sorted_tasks(|record| !record.done && record.family == family)
            .into_iter()
            .map(|stored| stored.record.clone())
            .collect())
    }

    async fn commit_stage(
        &self,
        task_id: &str,
        commit: &StageCommit,
    ) -> StorageResult<Option<TaskRecord>> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;

        match state.tasks.get(task_id) {
            Some(stored)
                if !stored.record.done && stored.record.stage == commit.expected_stage => {}
            _ => return Ok(None),
        }

        let mut segments_total = None;
        if let Some(segments) = &commit.segments {
            state.segments.retain(|_, segment| segment.task_id != task_id);
            for (ord, text) in segments.iter().enumerate() {
                let order = i32::try_from(ord)
                    .map_err(|e| StorageError::InvalidRecord(format!("segment order: {e}")))?;
                state.next_segment_id += 1;
                let id = state.next_segment_id;
                state.segments.insert(
                    id,
                    SegmentRecord {
                        id,
                        task_id: task_id.to_string(),
                        order,
                        text: text.clone(),
                        processed_text: None,
                        is_processing: false,
                        is_processed: false,
                    },
                );
            }
            segments_total = Some(
                i32::try_from(segments.len())
                    .map_err(|e| StorageError::InvalidRecord(format!("segment count: {e}")))?,
            );
        }

        let Some(task) = state.task_mut(task_id) else {
            return Ok(None);
        };
        task.stage.clone_from(&commit.next_stage);
        task.done = commit.done;
        if let Some(payload) = &commit.payload {
            task.payload = payload.clone();
        }
        if let Some(result) = &commit.result {
            task.result = Some(result.clone());
        }
        if let Some(total) = segments_total {
            task.segments_total = total;
            task.segments_processed = 0;
        }
        task.modified_at = next_modified_at(task.modified_at);
        Ok(Some(task.clone()))
    }

    async fn fail_task(
        &self,
        task_id: &str,
        error_stage: &str,
        message: &str,
    ) -> StorageResult<Option<TaskRecord>> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let Some(task) = state.task_mut(task_id).filter(|task| !task.done) else {
            return Ok(None);
        };
        task.stage = error_stage.to_string();
        task.done = true;
        task.error = Some(message.to_string());
        task.modified_at = next_modified_at(task.modified_at);
        Ok(Some(task.clone()))
    }

    async fn reopen_task(&self, task_id: &str, stage: &str) -> StorageResult<Option<TaskRecord>> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let (total, processed) = state.count_segments(task_id);
        let Some(task) = state
            .task_mut(task_id)
            .filter(|task| task.done && task.error.is_some())
        else {
            return Ok(None);
        };
        task.stage = stage.to_string();
        task.done = false;
        task.error = None;
        task.segments_total = total;
        task.segments_processed = processed;
        task.modified_at = next_modified_at(task.modified_at);
        Ok(Some(task.clone()))
    }

    async fn delete_task(&self, task_id: &str) -> StorageResult<bool> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        if state.tasks.remove(task_id).is_none() {
            return Ok(false);
        }
        state.segments.retain(|_, segment| segment.task_id != task_id);
        state.steps.retain(|step| step.task_id != task_id);
        Ok(true)
    }

    async fn claim_next_segment(&self, task_id: &str) -> StorageResult<Option<SegmentRecord>> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let next = state
            .segments
            .values_mut()
            .filter(|s| s.task_id == task_id && !s.is_processed && !s.is_processing)
            .min_by_key(|s| s.order);
        Ok(next.map(|segment| {
            segment.is_processing = true;
            segment.clone()
        }))
    }

    async fn complete_segment(
        &self,
        segment_id: i64,
        processed_text: &str,
    ) -> StorageResult<Option<TaskRecord>> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let Some(segment) = state
            .segments
            .get_mut(&segment_id)
            .filter(|segment| !segment.is_processed)
        else {
            return Ok(None);
        };
        segment.processed_text = Some(processed_text.to_string());
        segment.is_processed = true;
        segment.is_processing = false;
        let task_id = segment.task_id.clone();

        let (_, processed) = state.count_segments(&task_id);
        let Some(task) = state.task_mut(&task_id) else {
            return Ok(None);
        };
        task.segments_processed = processed;
        task.modified_at = next_modified_at(task.modified_at);
        Ok(Some(task.clone()))
    }

    async fn release_claim(&self, segment_id: i64) -> StorageResult<bool> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        match state.segments.get_mut(&segment_id) {
            Some(segment) if segment.is_processing => {
                segment.is_processing = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_stuck_segments(&self, task_id: &str) -> StorageResult<u64> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let mut reset = 0;
        for segment in state
            .segments
            .values_mut()
            .filter(|s| s.task_id == task_id && s.is_processing && !s.is_processed)
        {
            segment.is_processing = false;
            reset += 1;
        }
        Ok(reset)
    }

    async fn list_segments(&self, task_id: &str) -> StorageResult<Vec<SegmentRecord>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut segments: Vec<SegmentRecord> = state
            .segments
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        segments.sort_by_key(|s| s.order);
        Ok(segments)
    }

    async fn open_step(&self, task_id: &str, stage: &str) -> StorageResult<StepRecord> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        if let Some(open) = state.steps.iter().rev().find(|step| {
            step.task_id == task_id && step.stage == stage && step.status == StepStatus::InProgress
        }) {
            return Ok(open.clone());
        }

        state.next_step_id += 1;
        let step = StepRecord {
            id: state.next_step_id,
            task_id: task_id.to_string(),
            stage: stage.to_string(),
            status: StepStatus::InProgress,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        state.steps.push(step.clone());
        Ok(step)
    }

    async fn finish_step(
        &self,
        step_id: i64,
        status: StepStatus,
        error: Option<&str>,
    ) -> StorageResult<()> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        if let Some(step) = state.steps.iter_mut().find(|step| step.id == step_id) {
            step.status = status;
            step.finished_at = Some(Utc::now());
            step.error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn list_steps(&self, task_id: &str) -> StorageResult<Vec<StepRecord>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .steps
            .iter()
            .filter(|step| step.task_id == task_id)
            .cloned()
            .collect())
    }
}
