//! Error types for the pipeline engine

use speech_tasks_storage::StorageError;
use thiserror::Error;

/// Failure reported by a stage or segment executor
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("{0}")]
    Failed(String),

    #[error("External operation not found: {0}")]
    MissingOutput(String),

    #[error("Executor cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Unknown task family: {0}")]
    UnknownFamily(String),

    #[error("Unknown stage '{stage}' for family {family}")]
    UnknownStage { family: String, stage: String },

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type EngineResult<T> = Result<T, EngineError>;
