//! Subscription document punctuation
//!
//! A subscriber's document is split into word-bounded blocks and punctuated block by
//! block, each with the punctuated text that precedes it.

use crate::collaborators::Punctuator;
use crate::punctuation::PunctuateSegments;
use crate::segmenter::{Phrase, Segmenter};
use serde::{Deserialize, Serialize};
use speech_tasks_engine::{
    CancellationToken, ExecutorError, PipelineStage, SegmentExecutor, StageKind, StepExecutor,
    StepOutcome, TaskFamily,
};
use speech_tasks_storage::TaskRecord;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionStage {
    Created,
    Segmenting,
    Punctuating,
    Done,
    Error,
}

impl PipelineStage for SubscriptionStage {
    const ORDER: &'static [Self] = &[
        SubscriptionStage::Created,
        SubscriptionStage::Segmenting,
        SubscriptionStage::Punctuating,
    ];
    const DONE: Self = SubscriptionStage::Done;
    const ERROR: Self = SubscriptionStage::Error;

    fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStage::Created => "created",
            SubscriptionStage::Segmenting => "segmenting",
            SubscriptionStage::Punctuating => "punctuating",
            SubscriptionStage::Done => "done",
            SubscriptionStage::Error => "error",
        }
    }

    fn kind(&self) -> StageKind {
        match self {
            SubscriptionStage::Segmenting => StageKind::Step,
            SubscriptionStage::Punctuating => StageKind::FanOut,
            _ => StageKind::Passthrough,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPayload {
    pub subscription_id: String,
    pub document_id: String,
    pub text: String,
}

struct SplitDocument {
    segmenter: Segmenter,
}

#[async_trait::async_trait]
impl StepExecutor<SubscriptionPayload> for SplitDocument {
    async fn run(
        &self,
        _task: &TaskRecord,
        payload: &mut SubscriptionPayload,
        _cancel: &CancellationToken,
    ) -> Result<StepOutcome, ExecutorError> {
        let blocks = self.segmenter.segment(&Phrase::from_lines(&payload.text));
        if blocks.is_empty() {
            return Err(ExecutorError::failed("document is empty"));
        }
        Ok(StepOutcome::with_segments(blocks))
    }
}

/// Punctuation of documents submitted under a subscription
pub struct SubscriptionFamily {
    split: SplitDocument,
    punctuate: PunctuateSegments,
}

impl SubscriptionFamily {
    pub fn new(punctuator: Arc<dyn Punctuator>) -> Self {
        Self::with_segmenter(punctuator, Segmenter::default())
    }

    pub fn with_segmenter(punctuator: Arc<dyn Punctuator>, segmenter: Segmenter) -> Self {
        Self {
            split: SplitDocument { segmenter },
            punctuate: PunctuateSegments::new(punctuator),
        }
    }
}

impl TaskFamily for SubscriptionFamily {
    type Stage = SubscriptionStage;
    type Payload = SubscriptionPayload;

    fn name(&self) -> &'static str {
        "subscription"
    }

    fn logical_key(&self, payload: &SubscriptionPayload) -> String {
        format!("{}:{}", payload.subscription_id, payload.document_id)
    }

    fn default_concurrency(&self) -> usize {
        5
    }

    fn step(&self, stage: SubscriptionStage) -> Option<&dyn StepExecutor<SubscriptionPayload>> {
        match stage {
            SubscriptionStage::Segmenting => Some(&self.split),
            _ => None,
        }
    }

    fn fan_out(
        &self,
        stage: SubscriptionStage,
    ) -> Option<&dyn SegmentExecutor<SubscriptionPayload>> {
        match stage {
            SubscriptionStage::Punctuating => Some(&self.punctuate),
            _ => None,
        }
    }
}
