//! Task inspection and repair commands

use super::Session;
use crate::output;
use anyhow::{bail, Context as _, Result};
use clap::Args;
use speech_tasks_families::FAMILY_NAMES;
use speech_tasks_storage::{TaskRecord, TaskStore};
use tracing::info;

#[derive(Args)]
pub struct ListCommand {
    /// Only tasks of this family (audio, caption, openai, youtube, subscription)
    #[arg(short, long)]
    family: Option<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
}

impl ListCommand {
    pub async fn execute(self, session: &Session) -> Result<()> {
        if let Some(family) = &self.family {
            if !FAMILY_NAMES.contains(&family.as_str()) {
                bail!(
                    "Unknown family '{family}' (expected one of: {})",
                    FAMILY_NAMES.join(", ")
                );
            }
        }

        let tasks = session
            .store
            .list_tasks(self.family.as_deref())
            .await
            .context("Failed to list tasks")?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&tasks)?);
            return Ok(());
        }
        if tasks.is_empty() {
            println!("No tasks");
            return Ok(());
        }
        println!("{}", output::task_header());
        for task in &tasks {
            println!("{}", output::task_row(task));
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct TaskCommand {
    /// Task id
    #[arg(value_name = "TASK_ID")]
    task_id: String,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

impl TaskCommand {
    async fn load(&self, session: &Session) -> Result<TaskRecord> {
        session
            .store
            .get_task(&self.task_id)
            .await
            .context("Failed to load task")?
            .with_context(|| format!("Task {} not found", self.task_id))
    }

    fn print_task(&self, task: &TaskRecord) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(task)?);
        } else {
            println!("{}", output::task_details(task));
        }
        Ok(())
    }

    pub async fn status(self, session: &Session) -> Result<()> {
        let task = self.load(session).await?;
        self.print_task(&task)
    }

    pub async fn delete(self, session: &Session) -> Result<()> {
        let deleted = session
            .store
            .delete_task(&self.task_id)
            .await
            .context("Failed to delete task")?;
        if !deleted {
            bail!("Task {} not found", self.task_id);
        }
        info!(task_id = %self.task_id, "task deleted");
        println!("Deleted {}", self.task_id);
        Ok(())
    }

    pub async fn continue_task(self, session: &Session) -> Result<()> {
        let task = speech_tasks_families::continue_task(&session.store, &self.task_id)
            .await
            .context("Failed to continue task")?
            .with_context(|| format!("Task {} not found", self.task_id))?;
        if task.done {
            println!("Task {} is already finished", task.id);
        } else {
            info!(task_id = %task.id, stage = %task.stage, "task continued");
        }
        self.print_task(&task)
    }

    pub async fn reset_claims(self, session: &Session) -> Result<()> {
        self.load(session).await?;
        let released = session
            .store
            .reset_stuck_segments(&self.task_id)
            .await
            .context("Failed to reset claims")?;
        println!("Released {released} claimed segment(s) of {}", self.task_id);
        Ok(())
    }

    pub async fn steps(self, session: &Session) -> Result<()> {
        self.load(session).await?;
        let steps = session
            .store
            .list_steps(&self.task_id)
            .await
            .context("Failed to load step history")?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&steps)?);
            return Ok(());
        }
        for step in &steps {
            println!("{}", output::step_row(step));
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct SegmentsCommand {
    #[command(flatten)]
    task: TaskCommand,

    /// Only segments that are not processed yet
    #[arg(long)]
    pending: bool,
}

impl SegmentsCommand {
    pub async fn execute(self, session: &Session) -> Result<()> {
        self.task.load(session).await?;
        let segments = session
            .store
            .list_segments(&self.task.task_id)
            .await
            .context("Failed to load segments")?;

        let shown: Vec<_> = segments
            .iter()
            .filter(|s| !self.pending || !s.is_processed)
            .collect();
        if self.task.json {
            println!("{}", serde_json::to_string_pretty(&shown)?);
            return Ok(());
        }
        for segment in shown {
            println!("{}", output::segment_row(segment));
        }
        Ok(())
    }
}
