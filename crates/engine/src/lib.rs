//! Generic engine for durable multi-stage task pipelines
//!
//! A task family supplies an ordered stage enum ([`PipelineStage`]), a payload type
//! and one executor per working stage ([`TaskFamily`]). The engine drives every task
//! of the family through its stages against a [`TaskStore`](speech_tasks_storage::TaskStore):
//!
//! - [`StageMachine`] performs one unit of work per call and commits it atomically
//! - [`SegmentClaimer`] reserves fan-out segments one at a time
//! - [`TaskManager`] scans for unfinished tasks and runs bounded workers
//! - [`StagnationGuard`] parks tasks that stop making progress
//!
//! Work survives restarts because every stage is committed before the next begins
//! and executors check the payload for earlier output before redoing external work.

pub mod claimer;
pub mod config;
pub mod continuation;
pub mod error;
pub mod executor;
pub mod family;
pub mod machine;
pub mod scheduler;
pub mod stage;
pub mod stagnation;

pub use claimer::{Release, SegmentClaimer};
pub use config::{FamilyOverrides, PipelineConfig, SchedulerConfig};
pub use continuation::{prepare_continuation, resume_stage};
pub use error::{EngineError, EngineResult, ExecutorError};
pub use executor::{SegmentContext, SegmentExecutor, SegmentFallback, StepExecutor, StepOutcome};
pub use family::TaskFamily;
pub use machine::{StageMachine, TaskSnapshot};
pub use scheduler::{ScanReport, TaskManager};
pub use stage::{PipelineStage, StageKind};
pub use stagnation::{ProgressMarker, StagnationGuard};

pub use tokio_util::sync::CancellationToken;
