//! Durable storage for pipeline tasks
//!
//! This crate persists the three kinds of records a multi-stage task pipeline needs
//! to survive a process restart:
//! - **Tasks**: one row per unit of work, carrying the current stage, terminal flags,
//!   progress counters and the stage-specific payload
//! - **Segments**: claimable sub-units created when a task enters a fan-out stage
//! - **Steps**: one row per stage attempt (start, finish, outcome)
//!
//! # Backends
//!
//! - [`PostgresTaskStore`]: `PostgreSQL` via `tokio-postgres`, one session per operation
//! - [`MemoryTaskStore`]: in-process store with the same atomicity guarantees, used by
//!   tests and embedded hosts
//!
//! # Example
//!
//! ```rust,no_run
//! use speech_tasks_storage::{PostgresConfig, PostgresTaskStore, TaskStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresTaskStore::new(PostgresConfig::default());
//!     store.init_schema().await?;
//!
//!     for task in store.list_pending("audio").await? {
//!         println!("{} is at {}", task.id, task.stage);
//!     }
//!
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory_store;
pub mod postgres_store;

pub use memory_store::MemoryTaskStore;
pub use postgres_store::{PostgresConfig, PostgresTaskStore};

/// Storage layer errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("PostgreSQL error: {0}")]
    PostgresError(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

impl From<tokio_postgres::Error> for StorageError {
    fn from(err: tokio_postgres::Error) -> Self {
        StorageError::PostgresError(err.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Persisted state of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Stable task identifier
    pub id: String,

    /// Task family (`audio`, `caption`, ...)
    pub family: String,

    /// Deduplication key within the family (source file, video id, ...)
    pub logical_key: String,

    /// Persisted stage name
    pub stage: String,

    /// True once the task reached a terminal stage
    pub done: bool,

    /// Failure message, set only in the error stage
    pub error: Option<String>,

    /// Number of segments created by the last fan-out entry
    pub segments_total: i32,

    /// Number of those segments already processed
    pub segments_processed: i32,

    /// Stage-specific fields owned by the executors
    pub payload: serde_json::Value,

    /// Final or intermediate result text
    pub result: Option<String>,

    /// Who enqueued the task
    pub created_by: String,

    pub created_at: DateTime<Utc>,

    /// Bumped on every committed mutation
    pub modified_at: DateTime<Utc>,
}

/// A task about to be inserted
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub family: String,
    pub logical_key: String,
    /// Initial stage name
    pub stage: String,
    pub payload: serde_json::Value,
    pub created_by: String,
}

/// Outcome of an idempotent insert
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// A new row was written
    Created(TaskRecord),
    /// A non-terminal task with the same family and logical key already existed
    Existing(TaskRecord),
}

impl InsertOutcome {
    #[must_use]
    pub fn record(&self) -> &TaskRecord {
        match self {
            Self::Created(record) | Self::Existing(record) => record,
        }
    }

    #[must_use]
    pub fn into_record(self) -> TaskRecord {
        match self {
            Self::Created(record) | Self::Existing(record) => record,
        }
    }

    #[must_use]
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// One atomic stage transition
///
/// Applied only when the task is still at `expected_stage` and not done.
#[derive(Debug, Clone)]
pub struct StageCommit {
    pub expected_stage: String,
    pub next_stage: String,
    /// Set when `next_stage` is terminal
    pub done: bool,
    /// Replaces the payload when present
    pub payload: Option<serde_json::Value>,
    /// Replaces the result when present
    pub result: Option<String>,
    /// Purges the task's segments and inserts these in order when present
    pub segments: Option<Vec<String>>,
}

/// Persisted sub-unit of a fan-out stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub id: i64,
    pub task_id: String,
    /// Zero-based, contiguous
    pub order: i32,
    pub text: String,
    pub processed_text: Option<String>,
    pub is_processing: bool,
    pub is_processed: bool,
}

impl SegmentRecord {
    /// Output text, falling back to the input for unprocessed rows
    #[must_use]
    pub fn output(&self) -> &str {
        self.processed_text.as_deref().unwrap_or(&self.text)
    }
}

/// Status of a stage attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Completed,
    Error,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One stage attempt of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: i64,
    pub task_id: String,
    pub stage: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Next `modified_at` value, strictly greater than the previous one
///
/// Progress detection compares timestamps, so two commits inside the same clock tick
/// must still produce distinct values.
#[must_use]
pub fn next_modified_at(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    let floor = previous + Duration::microseconds(1);
    if now > floor {
        now
    } else {
        floor
    }
}

/// Task, segment and step persistence
///
/// Every method is a single atomic operation against the backend. Implementations
/// must not share one connection between concurrent callers.
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    /// Initialize schema (create tables if not exist)
    async fn init_schema(&self) -> StorageResult<()>;

    /// Insert a task unless a non-terminal task with the same family and key exists
    async fn insert_task(&self, task: &NewTask) -> StorageResult<InsertOutcome>;

    /// Retrieve a task by id
    async fn get_task(&self, task_id: &str) -> StorageResult<Option<TaskRecord>>;

    /// All tasks, newest first, optionally restricted to one family
    async fn list_tasks(&self, family: Option<&str>) -> StorageResult<Vec<TaskRecord>>;

    /// Non-terminal tasks of a family, oldest first
    async fn list_pending(&self, family: &str) -> StorageResult<Vec<TaskRecord>>;

    /// Apply a stage transition; `None` when the task is no longer at the expected stage
    async fn commit_stage(
        &self,
        task_id: &str,
        commit: &StageCommit,
    ) -> StorageResult<Option<TaskRecord>>;

    /// Move a non-terminal task to the error stage with a message
    async fn fail_task(
        &self,
        task_id: &str,
        error_stage: &str,
        message: &str,
    ) -> StorageResult<Option<TaskRecord>>;

    /// Clear the error of a task and put it back at `stage`
    async fn reopen_task(&self, task_id: &str, stage: &str) -> StorageResult<Option<TaskRecord>>;

    /// Remove a task together with its segments and steps
    async fn delete_task(&self, task_id: &str) -> StorageResult<bool>;

    /// Reserve the lowest-order segment that is neither processed nor claimed
    async fn claim_next_segment(&self, task_id: &str) -> StorageResult<Option<SegmentRecord>>;

    /// Store the output of a claimed segment and recount the task's progress
    async fn complete_segment(
        &self,
        segment_id: i64,
        processed_text: &str,
    ) -> StorageResult<Option<TaskRecord>>;

    /// Drop a claim without processing the segment
    async fn release_claim(&self, segment_id: i64) -> StorageResult<bool>;

    /// Clear claims left behind by a crashed worker; returns how many were reset
    async fn reset_stuck_segments(&self, task_id: &str) -> StorageResult<u64>;

    /// Segments of a task in order
    async fn list_segments(&self, task_id: &str) -> StorageResult<Vec<SegmentRecord>>;

    /// Re-use the in-progress step for this stage or start a new one
    async fn open_step(&self, task_id: &str, stage: &str) -> StorageResult<StepRecord>;

    /// Close a step with its final status
    async fn finish_step(
        &self,
        step_id: i64,
        status: StepStatus,
        error: Option<&str>,
    ) -> StorageResult<()>;

    /// Steps of a task in start order
    async fn list_steps(&self, task_id: &str) -> StorageResult<Vec<StepRecord>>;
}
