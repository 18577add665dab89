//! Task family contract

use crate::executor::{SegmentExecutor, StepExecutor};
use crate::stage::PipelineStage;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A kind of task: its stage order, payload shape and executors
pub trait TaskFamily: Send + Sync + 'static {
    type Stage: PipelineStage;

    /// Stage-specific fields persisted on the task between stages
    type Payload: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Persisted family name
    fn name(&self) -> &'static str;

    /// Deduplication key; enqueueing a payload whose key matches an unfinished task
    /// returns that task instead of creating a new one
    fn logical_key(&self, payload: &Self::Payload) -> String;

    fn default_concurrency(&self) -> usize;

    /// Joins processed segments into the fan-out stage result
    fn segment_separator(&self) -> &str {
        "\n"
    }

    fn step(&self, stage: Self::Stage) -> Option<&dyn StepExecutor<Self::Payload>>;

    fn fan_out(&self, stage: Self::Stage) -> Option<&dyn SegmentExecutor<Self::Payload>>;
}
