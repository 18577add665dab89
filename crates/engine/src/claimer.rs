//! Segment claiming
//!
//! Exclusivity comes from the store: a claim is a single atomic update that flips
//! `is_processing` on the lowest-order eligible segment. One worker per task drives
//! claims, so context-dependent executors always see earlier segments committed.

use crate::error::EngineResult;
use crate::executor::SegmentContext;
use speech_tasks_storage::{SegmentRecord, TaskRecord, TaskStore};
use std::sync::Arc;
use tracing::{debug, info};

/// How a claimed segment is released
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Store the executor output
    Processed(String),
    /// Store the input text unchanged
    Degraded,
    /// Give the claim back without processing
    Abandon,
}

#[derive(Clone)]
pub struct SegmentClaimer {
    store: Arc<dyn TaskStore>,
}

impl SegmentClaimer {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub async fn claim_next(&self, task_id: &str) -> EngineResult<Option<SegmentRecord>> {
        let segment = self.store.claim_next_segment(task_id).await?;
        if let Some(segment) = &segment {
            debug!(task_id, order = segment.order, "claimed segment");
        }
        Ok(segment)
    }

    /// Release a claim; returns the owning task when the segment was marked processed
    pub async fn release(
        &self,
        segment: &SegmentRecord,
        release: Release,
    ) -> EngineResult<Option<TaskRecord>> {
        let text = match release {
            Release::Processed(text) => text,
            Release::Degraded => segment.text.clone(),
            Release::Abandon => {
                self.store.release_claim(segment.id).await?;
                return Ok(None);
            }
        };
        Ok(self.store.complete_segment(segment.id, &text).await?)
    }

    /// Clear claims a crashed worker left behind
    pub async fn recover(&self, task_id: &str) -> EngineResult<u64> {
        let reset = self.store.reset_stuck_segments(task_id).await?;
        if reset > 0 {
            info!(task_id, reset, "reset stuck segment claims");
        }
        Ok(reset)
    }

    /// Outputs of processed segments ordered before `segment`
    pub async fn context_for(&self, segment: &SegmentRecord) -> EngineResult<SegmentContext> {
        let previous = self
            .store
            .list_segments(&segment.task_id)
            .await?
            .into_iter()
            .filter(|s| s.order < segment.order && s.is_processed)
            .map(|s| s.output().to_string())
            .collect();
        Ok(SegmentContext { previous })
    }

    /// Every segment of the task, or `None` while some are still unprocessed
    pub async fn finished_segments(&self, task_id: &str) -> EngineResult<Option<Vec<SegmentRecord>>> {
        let segments = self.store.list_segments(task_id).await?;
        if segments.iter().all(|s| s.is_processed) {
            Ok(Some(segments))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use speech_tasks_storage::{MemoryTaskStore, NewTask, StageCommit};

    async fn store_with_segments(count: usize) -> Arc<dyn TaskStore> {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        store
            .insert_task(&NewTask {
                id: "t1".to_string(),
                family: "sample".to_string(),
                logical_key: "k".to_string(),
                stage: "created".to_string(),
                payload: json!({}),
                created_by: "tests".to_string(),
            })
            .await
            .unwrap();
        store
            .commit_stage(
                "t1",
                &StageCommit {
                    expected_stage: "created".to_string(),
                    next_stage: "polishing".to_string(),
                    done: false,
                    payload: None,
                    result: None,
                    segments: Some((0..count).map(|i| format!("s{i}")).collect()),
                },
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_release_variants() {
        let claimer = SegmentClaimer::new(store_with_segments(3).await);

        let first = claimer.claim_next("t1").await.unwrap().unwrap();
        let task = claimer
            .release(&first, Release::Processed("S0".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.segments_processed, 1);

        let second = claimer.claim_next("t1").await.unwrap().unwrap();
        assert!(claimer
            .release(&second, Release::Abandon)
            .await
            .unwrap()
            .is_none());

        // Abandoned segment is claimable again
        let again = claimer.claim_next("t1").await.unwrap().unwrap();
        assert_eq!(again.id, second.id);
        claimer.release(&again, Release::Degraded).await.unwrap();

        let context = claimer
            .context_for(&claimer.claim_next("t1").await.unwrap().unwrap())
            .await
            .unwrap();
        assert_eq!(context.previous, vec!["S0".to_string(), "s1".to_string()]);
    }

    #[tokio::test]
    async fn test_recover_and_finished() {
        let claimer = SegmentClaimer::new(store_with_segments(1).await);

        claimer.claim_next("t1").await.unwrap().unwrap();
        assert!(claimer.claim_next("t1").await.unwrap().is_none());
        assert!(claimer.finished_segments("t1").await.unwrap().is_none());

        assert_eq!(claimer.recover("t1").await.unwrap(), 1);
        let segment = claimer.claim_next("t1").await.unwrap().unwrap();
        claimer
            .release(&segment, Release::Processed("done".to_string()))
            .await
            .unwrap();

        let finished = claimer.finished_segments("t1").await.unwrap().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].output(), "done");
    }
}
