pub mod schema;
pub mod tasks;

use anyhow::{Context as _, Result};
use speech_tasks_engine::PipelineConfig;
use speech_tasks_storage::PostgresTaskStore;
use std::path::Path;

/// Configuration and store shared by every command
pub struct Session {
    pub config: PipelineConfig,
    pub store: PostgresTaskStore,
}

impl Session {
    pub fn open(config_path: Option<&Path>) -> Result<Self> {
        let config = match config_path {
            Some(path) => PipelineConfig::from_yaml(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        let store = PostgresTaskStore::new(config.postgres.clone());
        Ok(Self { config, store })
    }
}
