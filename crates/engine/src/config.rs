//! Pipeline configuration
//!
//! Loaded from YAML; any field left out falls back to environment variables and
//! then to built-in defaults.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use speech_tasks_storage::PostgresConfig;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const DEFAULT_SCAN_INTERVAL_MS: u64 = 5_000;
const DEFAULT_STAGNATION_BACKOFF_MS: u64 = 5_000;
const MIN_STAGNATION_BACKOFF_MS: u64 = 10;

/// Positive millisecond value from the environment, or `default`
fn env_millis(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&ms| ms > 0)
        .unwrap_or(default)
}

/// Scheduler settings for one task family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker limit; the family default applies when unset
    pub max_concurrent: Option<usize>,

    /// Period of the host scan loop in milliseconds
    pub scan_interval_ms: u64,

    /// How long a stagnating task waits before it is admitted again
    pub stagnation_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            scan_interval_ms: env_millis("SPEECH_TASKS_SCAN_INTERVAL_MS", DEFAULT_SCAN_INTERVAL_MS),
            stagnation_backoff_ms: env_millis(
                "SPEECH_TASKS_STAGNATION_BACKOFF_MS",
                DEFAULT_STAGNATION_BACKOFF_MS,
            ),
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Deferral of a stagnating task, never shorter than a few milliseconds
    #[must_use]
    pub fn stagnation_backoff(&self) -> Duration {
        Duration::from_millis(self.stagnation_backoff_ms.max(MIN_STAGNATION_BACKOFF_MS))
    }

    /// Worker limit, never below one
    #[must_use]
    pub fn concurrency(&self, family_default: usize) -> usize {
        self.max_concurrent.unwrap_or(family_default).max(1)
    }
}

/// Per-family overrides of [`SchedulerConfig`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FamilyOverrides {
    pub max_concurrent: Option<usize>,
    pub stagnation_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub postgres: PostgresConfig,
    pub scheduler: SchedulerConfig,
    pub families: HashMap<String, FamilyOverrides>,
}

impl PipelineConfig {
    pub fn from_yaml_str(contents: &str) -> EngineResult<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml(path: impl AsRef<Path>) -> EngineResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    /// Scheduler settings with the family's overrides applied
    #[must_use]
    pub fn scheduler_for(&self, family: &str) -> SchedulerConfig {
        let mut config = self.scheduler.clone();
        if let Some(overrides) = self.families.get(family) {
            if overrides.max_concurrent.is_some() {
                config.max_concurrent = overrides.max_concurrent;
            }
            if let Some(backoff) = overrides.stagnation_backoff_ms {
                config.stagnation_backoff_ms = backoff;
            }
        }
        config
    }

    fn validate(&self) -> EngineResult<()> {
        if self.scheduler.scan_interval_ms == 0 {
            return Err(EngineError::Config(
                "scheduler.scan_interval_ms must be positive".to_string(),
            ));
        }
        if self.scheduler.stagnation_backoff_ms == 0 {
            return Err(EngineError::Config(
                "scheduler.stagnation_backoff_ms must be positive".to_string(),
            ));
        }
        for (family, overrides) in &self.families {
            if overrides.stagnation_backoff_ms == Some(0) {
                return Err(EngineError::Config(format!(
                    "families.{family}.stagnation_backoff_ms must be positive"
                )));
            }
            if overrides.max_concurrent == Some(0) {
                return Err(EngineError::Config(format!(
                    "families.{family}.max_concurrent must be positive"
                )));
            }
        }
        Ok(())
    }
}
