//! Speech tasks CLI
//!
//! Administrative interface to the durable task store: inspect tasks, repair stuck
//! claims and put failed tasks back on their pipeline.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::tasks::{ListCommand, SegmentsCommand, TaskCommand};
use commands::Session;

#[derive(Parser)]
#[command(
    name = "speech-tasks",
    version,
    about = "Inspect and repair durable speech processing tasks",
    after_help = "EXAMPLES:\n  \
                  # Create tables and indexes\n  \
                  speech-tasks init-schema\n\n  \
                  # Show unfinished and finished caption tasks\n  \
                  speech-tasks list --family caption\n\n  \
                  # Put a failed task back at the stage that failed\n  \
                  speech-tasks continue 3f1c...\n\n  \
                  # Release segments left claimed by a crashed worker\n  \
                  speech-tasks reset-claims 3f1c..."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// YAML configuration file (database and scheduler settings)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the task, segment and step tables
    InitSchema,

    /// List tasks, newest first
    List(ListCommand),

    /// Show one task
    Status(TaskCommand),

    /// Delete a task with its segments and step history
    Delete(TaskCommand),

    /// Make a failed task runnable again
    Continue(TaskCommand),

    /// Release segments stuck in processing (stop every scheduler that owns the task first)
    ResetClaims(TaskCommand),

    /// Show the stage attempts of a task
    Steps(TaskCommand),

    /// Show the segments of a task
    Segments(SegmentsCommand),

    /// Print the effective configuration
    Config,
}

fn init_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose {
        "speech_tasks=debug"
    } else {
        "speech_tasks=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to set tracing subscriber")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let session = Session::open(cli.config.as_deref())?;

    match cli.command {
        Commands::InitSchema => commands::schema::init_schema(&session).await,
        Commands::List(cmd) => cmd.execute(&session).await,
        Commands::Status(cmd) => cmd.status(&session).await,
        Commands::Delete(cmd) => cmd.delete(&session).await,
        Commands::Continue(cmd) => cmd.continue_task(&session).await,
        Commands::ResetClaims(cmd) => cmd.reset_claims(&session).await,
        Commands::Steps(cmd) => cmd.steps(&session).await,
        Commands::Segments(cmd) => cmd.execute(&session).await,
        Commands::Config => commands::schema::show_config(&session),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "speech-tasks",
            "list",
            "--family",
            "audio",
            "--verbose",
            "--config",
            "pipeline.yaml",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("pipeline.yaml")));
        assert!(matches!(cli.command, Commands::List(_)));
    }

    #[test]
    fn test_task_id_is_required() {
        assert!(Cli::try_parse_from(["speech-tasks", "status"]).is_err());
        assert!(Cli::try_parse_from(["speech-tasks", "reset-claims", "t1"]).is_ok());
    }
}
