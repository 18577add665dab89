//! Ordered stage sequences
//!
//! Each task family declares its stages as a plain enum and implements
//! [`PipelineStage`] for it. The engine only ever moves a task one position forward
//! along [`PipelineStage::ORDER`], or straight to [`PipelineStage::ERROR`].

use std::fmt::Debug;
use std::hash::Hash;

/// How the engine drives a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// No executor; the task moves on immediately
    Passthrough,
    /// One executor call per attempt
    Step,
    /// Re-entered once per segment until every segment is processed
    FanOut,
}

pub trait PipelineStage: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Non-terminal stages in execution order; the first one is the initial stage
    const ORDER: &'static [Self];

    const DONE: Self;

    const ERROR: Self;

    /// Persisted name
    fn as_str(&self) -> &'static str;

    fn kind(&self) -> StageKind;

    fn parse(name: &str) -> Option<Self> {
        Self::ORDER
            .iter()
            .copied()
            .chain([Self::DONE, Self::ERROR])
            .find(|stage| stage.as_str() == name)
    }

    fn initial() -> Self {
        Self::ORDER.first().copied().unwrap_or(Self::DONE)
    }

    fn is_terminal(&self) -> bool {
        *self == Self::DONE || *self == Self::ERROR
    }

    /// Position in the total order; `DONE` ranks after every stage and `ERROR` last
    fn rank(&self) -> usize {
        if *self == Self::DONE {
            return Self::ORDER.len();
        }
        if *self == Self::ERROR {
            return Self::ORDER.len() + 1;
        }
        Self::ORDER
            .iter()
            .position(|stage| stage == self)
            .unwrap_or(Self::ORDER.len())
    }

    /// Next stage on success; `None` for terminal stages
    fn successor(&self) -> Option<Self> {
        if self.is_terminal() {
            return None;
        }
        let index = Self::ORDER.iter().position(|stage| stage == self)?;
        Some(Self::ORDER.get(index + 1).copied().unwrap_or(Self::DONE))
    }

    fn predecessor(&self) -> Option<Self> {
        if *self == Self::DONE {
            return Self::ORDER.last().copied();
        }
        let index = Self::ORDER.iter().position(|stage| stage == self)?;
        index.checked_sub(1).and_then(|i| Self::ORDER.get(i).copied())
    }
}
