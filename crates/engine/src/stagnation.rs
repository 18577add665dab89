//! Stagnation detection
//!
//! A worker compares a task's progress marker before and after every advance. An
//! unchanged marker after a call that did not fail means the task is waiting on
//! something outside the pipeline, so the worker stops and the task sits out one
//! backoff period before it can be admitted again.

use crate::machine::TaskSnapshot;
use chrono::{DateTime, Utc};
use speech_tasks_storage::TaskRecord;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Persisted fields that change whenever a task makes progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressMarker {
    pub stage: String,
    pub segments_processed: i32,
    pub modified_at: DateTime<Utc>,
}

impl ProgressMarker {
    #[must_use]
    pub fn of_record(record: &TaskRecord) -> Self {
        Self {
            stage: record.stage.clone(),
            segments_processed: record.segments_processed,
            modified_at: record.modified_at,
        }
    }

    #[must_use]
    pub fn of_snapshot<S: crate::PipelineStage>(snapshot: &TaskSnapshot<S>) -> Self {
        Self {
            stage: snapshot.stage.as_str().to_string(),
            segments_processed: snapshot.segments_processed,
            modified_at: snapshot.modified_at,
        }
    }
}

pub struct StagnationGuard {
    backoff: Duration,
    deferred: Mutex<HashMap<String, Instant>>,
    rescan_scheduled: AtomicBool,
}

impl StagnationGuard {
    #[must_use]
    pub fn new(backoff: Duration) -> Self {
        Self {
            backoff,
            deferred: Mutex::new(HashMap::new()),
            rescan_scheduled: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Keep a task out of admission for one backoff period
    pub async fn defer(&self, task_id: &str) {
        let until = Instant::now() + self.backoff;
        self.deferred.lock().await.insert(task_id.to_string(), until);
    }

    /// True while the task's backoff has not elapsed; expired entries are dropped
    pub async fn is_deferred(&self, task_id: &str) -> bool {
        let mut deferred = self.deferred.lock().await;
        match deferred.get(task_id) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                deferred.remove(task_id);
                false
            }
            None => false,
        }
    }

    pub async fn clear(&self, task_id: &str) {
        self.deferred.lock().await.remove(task_id);
    }

    pub async fn has_deferred(&self) -> bool {
        !self.deferred.lock().await.is_empty()
    }

    /// Claim the single pending rescan slot; false when one is already scheduled
    pub fn try_schedule_rescan(&self) -> bool {
        !self.rescan_scheduled.swap(true, Ordering::AcqRel)
    }

    pub fn rescan_started(&self) {
        self.rescan_scheduled.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deferral_expires_after_backoff() {
        let guard = StagnationGuard::new(Duration::from_secs(5));
        guard.defer("t1").await;
        assert!(guard.is_deferred("t1").await);
        assert!(!guard.is_deferred("t2").await);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(guard.is_deferred("t1").await);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!guard.is_deferred("t1").await);
        assert!(!guard.has_deferred().await);
    }

    #[test]
    fn test_rescan_slot_is_coalesced() {
        let guard = StagnationGuard::new(Duration::from_millis(10));
        assert!(guard.try_schedule_rescan());
        assert!(!guard.try_schedule_rescan());
        guard.rescan_started();
        assert!(guard.try_schedule_rescan());
    }

    #[test]
    fn test_marker_detects_counter_change() {
        let now = Utc::now();
        let before = ProgressMarker {
            stage: "polishing".to_string(),
            segments_processed: 2,
            modified_at: now,
        };
        let mut after = before.clone();
        assert_eq!(before, after);
        after.segments_processed = 3;
        assert_ne!(before, after);
    }
}
