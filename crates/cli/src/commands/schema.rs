//! Schema and configuration commands

use super::Session;
use anyhow::{Context as _, Result};
use speech_tasks_families::FAMILY_NAMES;
use speech_tasks_storage::TaskStore;
use tracing::info;

pub async fn init_schema(session: &Session) -> Result<()> {
    session
        .store
        .init_schema()
        .await
        .context("Failed to initialize schema")?;
    info!(
        database = %session.config.postgres.database,
        host = %session.config.postgres.host,
        "schema ready"
    );
    println!("Schema initialized");
    Ok(())
}

pub fn show_config(session: &Session) -> Result<()> {
    let mut printable = session.config.clone();
    printable.postgres.password = "********".to_string();
    let yaml = serde_yaml::to_string(&printable).context("Failed to render config")?;
    println!("{yaml}");

    println!("Per-family scheduler settings:");
    for family in FAMILY_NAMES {
        let scheduler = session.config.scheduler_for(family);
        let max_concurrent = scheduler
            .max_concurrent
            .map_or_else(|| "family default".to_string(), |n| n.to_string());
        println!(
            "  {family:<13} max_concurrent={max_concurrent} backoff={}ms scan={}ms",
            scheduler.stagnation_backoff_ms, scheduler.scan_interval_ms
        );
    }
    Ok(())
}
