//! Task store implementation using `PostgreSQL`
//!
//! Every operation opens its own session, so concurrently running workers never share
//! a connection. Multi-statement operations run inside a single transaction.

use crate::{
    InsertOutcome, NewTask, SegmentRecord, StageCommit, StepRecord, StepStatus, StorageError,
    StorageResult, TaskRecord, TaskStore,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_postgres::{Client, NoTls, Row};
use tracing::debug;

const TASK_COLUMNS: &str = "id, family, logical_key, stage, done, error, segments_total, \
     segments_processed, payload, result, created_by, created_at, modified_at";

const SEGMENT_COLUMNS: &str = "id, task_id, ord, text, processed_text, is_processing, is_processed";

const STEP_COLUMNS: &str = "id, task_id, stage, status, started_at, finished_at, error";

/// `PostgreSQL` configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// Database host
    pub host: String,

    /// Database port
    pub port: u16,

    /// Database name
    pub database: String,

    /// Database user
    pub user: String,

    /// Database password
    pub password: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("POSTGRES_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            database: std::env::var("POSTGRES_DB").unwrap_or_else(|_| "speech_tasks".to_string()),
            user: std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("POSTGRES_PASSWORD").unwrap_or_default(),
        }
    }
}

impl PostgresConfig {
    /// Build connection string
    #[must_use]
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password
        )
    }
}

/// `PostgreSQL` task store
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    config: PostgresConfig,
}

impl PostgresTaskStore {
    #[must_use]
    pub fn new(config: PostgresConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }

    /// Open a fresh session for one operation
    async fn connect(&self) -> StorageResult<Client> {
        let (client, connection) =
            tokio_postgres::connect(&self.config.connection_string(), NoTls)
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        // Spawn connection in background
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(client)
    }
}

fn task_from_row(row: &Row) -> StorageResult<TaskRecord> {
    Ok(TaskRecord {
        id: row.try_get("id")?,
        family: row.try_get("family")?,
        logical_key: row.try_get("logical_key")?,
        stage: row.try_get("stage")?,
        done: row.try_get("done")?,
        error: row.try_get("error")?,
        segments_total: row.try_get("segments_total")?,
        segments_processed: row.try_get("segments_processed")?,
        payload: row.try_get("payload")?,
        result: row.try_get("result")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
    })
}

fn segment_from_row(row: &Row) -> StorageResult<SegmentRecord> {
    Ok(SegmentRecord {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        order: row.try_get("ord")?,
        text: row.try_get("text")?,
        processed_text: row.try_get("processed_text")?,
        is_processing: row.try_get("is_processing")?,
        is_processed: row.try_get("is_processed")?,
    })
}

fn step_from_row(row: &Row) -> StorageResult<StepRecord> {
    let status: String = row.try_get("status")?;
    Ok(StepRecord {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        stage: row.try_get("stage")?,
        status: StepStatus::parse(&status)
            .ok_or_else(|| StorageError::InvalidRecord(format!("unknown step status {status}")))?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        error: row.try_get("error")?,
    })
}

async fn find_open_task(
    client: &Client,
    family: &str,
    logical_key: &str,
) -> StorageResult<Option<TaskRecord>> {
    let row = client
        .query_opt(
            &format!(
                "SELECT {TASK_COLUMNS} FROM pipeline_tasks \
                 WHERE family = $1 AND logical_key = $2 AND NOT done"
            ),
            &[&family, &logical_key],
        )
        .await?;
    row.as_ref().map(task_from_row).transpose()
}

#[async_trait::async_trait]
impl TaskStore for PostgresTaskStore {
    async fn init_schema(&self) -> StorageResult<()> {
        let client = self.connect().await?;

        client
            .batch_execute(
                r"
                CREATE TABLE IF NOT EXISTS pipeline_tasks (
                    id TEXT PRIMARY KEY,
                    family TEXT NOT NULL,
                    logical_key TEXT NOT NULL,
                    stage TEXT NOT NULL,
                    done BOOLEAN NOT NULL DEFAULT FALSE,
                    error TEXT,
                    segments_total INTEGER NOT NULL DEFAULT 0,
                    segments_processed INTEGER NOT NULL DEFAULT 0,
                    payload JSONB NOT NULL DEFAULT '{}'::jsonb,
                    result TEXT,
                    created_by TEXT NOT NULL,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL,
                    modified_at TIMESTAMP WITH TIME ZONE NOT NULL,
                    CHECK (segments_processed <= segments_total)
                );

                CREATE TABLE IF NOT EXISTS pipeline_segments (
                    id BIGSERIAL PRIMARY KEY,
                    task_id TEXT NOT NULL REFERENCES pipeline_tasks(id) ON DELETE CASCADE,
                    ord INTEGER NOT NULL,
                    text TEXT NOT NULL,
                    processed_text TEXT,
                    is_processing BOOLEAN NOT NULL DEFAULT FALSE,
                    is_processed BOOLEAN NOT NULL DEFAULT FALSE,
                    UNIQUE (task_id, ord),
                    CHECK (NOT (is_processed AND is_processing))
                );

                CREATE TABLE IF NOT EXISTS pipeline_steps (
                    id BIGSERIAL PRIMARY KEY,
                    task_id TEXT NOT NULL REFERENCES pipeline_tasks(id) ON DELETE CASCADE,
                    stage TEXT NOT NULL,
                    status TEXT NOT NULL,
                    started_at TIMESTAMP WITH TIME ZONE NOT NULL,
                    finished_at TIMESTAMP WITH TIME ZONE,
                    error TEXT
                );
                ",
            )
            .await?;

        // Indexes for the pending scan, claim selection and enqueue deduplication
        client
            .batch_execute(
                r"
                CREATE INDEX IF NOT EXISTS idx_pipeline_tasks_stage ON pipeline_tasks(stage);
                CREATE INDEX IF NOT EXISTS idx_pipeline_tasks_pending
                    ON pipeline_tasks(family, created_at) WHERE NOT done;
                CREATE UNIQUE INDEX IF NOT EXISTS idx_pipeline_tasks_open_key
                    ON pipeline_tasks(family, logical_key) WHERE NOT done;
                CREATE INDEX IF NOT EXISTS idx_pipeline_steps_task ON pipeline_steps(task_id, id);
                ",
            )
            .await?;

        debug!("pipeline schema initialized");
        Ok(())
    }

    async fn insert_task(&self, task: &NewTask) -> StorageResult<InsertOutcome> {
        let client = self.connect().await?;
        let now = Utc::now();

        let inserted = client
            .query_opt(
                &format!(
                    "INSERT INTO pipeline_tasks \
                     (id, family, logical_key, stage, payload, created_by, created_at, modified_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $7) \
                     ON CONFLICT (family, logical_key) WHERE NOT done DO NOTHING \
                     RETURNING {TASK_COLUMNS}"
                ),
                &[
                    &task.id,
                    &task.family,
                    &task.logical_key,
                    &task.stage,
                    &task.payload,
                    &task.created_by,
                    &now,
                ],
            )
            .await?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Created(task_from_row(&row)?));
        }

        // The open task may have finished between the conflict and this read
        match find_open_task(&client, &task.family, &task.logical_key).await? {
            Some(existing) => Ok(InsertOutcome::Existing(existing)),
            None => Err(StorageError::PostgresError(format!(
                "insert of {}/{} conflicted without an open task",
                task.family, task.logical_key
            ))),
        }
    }

    async fn get_task(&self, task_id: &str) -> StorageResult<Option<TaskRecord>> {
        let client = self.connect().await?;
        let row = client
            .query_opt(
                &format!("SELECT {TASK_COLUMNS} FROM pipeline_tasks WHERE id = $1"),
                &[&task_id],
            )
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_tasks(&self, family: Option<&str>) -> StorageResult<Vec<TaskRecord>> {
        let client = self.connect().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM pipeline_tasks \
                     WHERE $1::text IS NULL OR family = $1 \
                     ORDER BY created_at DESC"
                ),
                &[&family],
            )
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn list_pending(&self, family: &str) -> StorageResult<Vec<TaskRecord>> {
        let client = self.connect().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM pipeline_tasks \
                     WHERE family = $1 AND NOT done \
                     ORDER BY created_at"
                ),
                &[&family],
            )
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn commit_stage(
        &self,
        task_id: &str,
        commit: &StageCommit,
    ) -> StorageResult<Option<TaskRecord>> {
        let mut client = self.connect().await?;
        let tx = client.transaction().await?;

        let locked = tx
            .query_opt(
                "SELECT id FROM pipeline_tasks \
                 WHERE id = $1 AND stage = $2 AND NOT done FOR UPDATE",
                &[&task_id, &commit.expected_stage],
            )
            .await?;
        if locked.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        let mut segments_total: Option<i32> = None;
        if let Some(segments) = &commit.segments {
            tx.execute(
                "DELETE FROM pipeline_segments WHERE task_id = $1",
                &[&task_id],
            )
            .await?;

            let insert = tx
                .prepare("INSERT INTO pipeline_segments (task_id, ord, text) VALUES ($1, $2, $3)")
                .await?;
            for (ord, text) in segments.iter().enumerate() {
                let ord = i32::try_from(ord)
                    .map_err(|e| StorageError::InvalidRecord(format!("segment order: {e}")))?;
                tx.execute(&insert, &[&task_id, &ord, text]).await?;
            }
            segments_total = Some(
                i32::try_from(segments.len())
                    .map_err(|e| StorageError::InvalidRecord(format!("segment count: {e}")))?,
            );
        }

        let now = Utc::now();
        let row = tx
            .query_one(
                &format!(
                    "UPDATE pipeline_tasks SET \
                       stage = $2, \
                       done = $3, \
                       payload = COALESCE($4::jsonb, payload), \
                       result = COALESCE($5::text, result), \
                       segments_total = COALESCE($6::int, segments_total), \
                       segments_processed = CASE WHEN $6::int IS NULL THEN segments_processed ELSE 0 END, \
                       modified_at = GREATEST($7, modified_at + INTERVAL '1 microsecond') \
                     WHERE id = $1 \
                     RETURNING {TASK_COLUMNS}"
                ),
                &[
                    &task_id,
                    &commit.next_stage,
                    &commit.done,
                    &commit.payload,
                    &commit.result,
                    &segments_total,
                    &now,
                ],
            )
            .await?;
        let record = task_from_row(&row)?;

        tx.commit().await?;
        Ok(Some(record))
    }

    async fn fail_task(
        &self,
        task_id: &str,
        error_stage: &str,
        message: &str,
    ) -> StorageResult<Option<TaskRecord>> {
        let client = self.connect().await?;
        let now = Utc::now();
        let row = client
            .query_opt(
                &format!(
                    "UPDATE pipeline_tasks SET \
                       stage = $2, done = TRUE, error = $3, \
                       modified_at = GREATEST($4, modified_at + INTERVAL '1 microsecond') \
                     WHERE id = $1 AND NOT done \
                     RETURNING {TASK_COLUMNS}"
                ),
                &[&task_id, &error_stage, &message, &now],
            )
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn reopen_task(&self, task_id: &str, stage: &str) -> StorageResult<Option<TaskRecord>> {
        let client = self.connect().await?;
        let now = Utc::now();
        let row = client
            .query_opt(
                &format!(
                    "UPDATE pipeline_tasks t SET \
                       stage = $2, done = FALSE, error = NULL, \
                       segments_total = s.total, \
                       segments_processed = s.processed, \
                       modified_at = GREATEST($3, t.modified_at + INTERVAL '1 microsecond') \
                     FROM ( \
                       SELECT COUNT(*)::int AS total, \
                              COUNT(*) FILTER (WHERE is_processed)::int AS processed \
                       FROM pipeline_segments WHERE task_id = $1 \
                     ) s \
                     WHERE t.id = $1 AND t.done AND t.error IS NOT NULL \
                     RETURNING {TASK_COLUMNS}"
                ),
                &[&task_id, &stage, &now],
            )
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn delete_task(&self, task_id: &str) -> StorageResult<bool> {
        let client = self.connect().await?;
        let deleted = client
            .execute("DELETE FROM pipeline_tasks WHERE id = $1", &[&task_id])
            .await?;
        Ok(deleted > 0)
    }

    async fn claim_next_segment(&self, task_id: &str) -> StorageResult<Option<SegmentRecord>> {
        let client = self.connect().await?;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE pipeline_segments SET is_processing = TRUE \
                     WHERE id = ( \
                       SELECT id FROM pipeline_segments \
                       WHERE task_id = $1 AND NOT is_processed AND NOT is_processing \
                       ORDER BY ord \
                       LIMIT 1 \
                       FOR UPDATE SKIP LOCKED \
                     ) AND NOT is_processing \
                     RETURNING {SEGMENT_COLUMNS}"
                ),
                &[&task_id],
            )
            .await?;
        row.as_ref().map(segment_from_row).transpose()
    }

    async fn complete_segment(
        &self,
        segment_id: i64,
        processed_text: &str,
    ) -> StorageResult<Option<TaskRecord>> {
        let mut client = self.connect().await?;
        let tx = client.transaction().await?;

        let updated = tx
            .query_opt(
                "UPDATE pipeline_segments SET \
                   processed_text = $2, is_processed = TRUE, is_processing = FALSE \
                 WHERE id = $1 AND NOT is_processed \
                 RETURNING task_id",
                &[&segment_id, &processed_text],
            )
            .await?;
        let Some(updated) = updated else {
            tx.rollback().await?;
            return Ok(None);
        };
        let task_id: String = updated.try_get("task_id")?;

        let now = Utc::now();
        let row = tx
            .query_one(
                &format!(
                    "UPDATE pipeline_tasks SET \
                       segments_processed = ( \
                         SELECT COUNT(*)::int FROM pipeline_segments \
                         WHERE task_id = $1 AND is_processed \
                       ), \
                       modified_at = GREATEST($2, modified_at + INTERVAL '1 microsecond') \
                     WHERE id = $1 \
                     RETURNING {TASK_COLUMNS}"
                ),
                &[&task_id, &now],
            )
            .await?;
        let record = task_from_row(&row)?;

        tx.commit().await?;
        Ok(Some(record))
    }

    async fn release_claim(&self, segment_id: i64) -> StorageResult<bool> {
        let client = self.connect().await?;
        let released = client
            .execute(
                "UPDATE pipeline_segments SET is_processing = FALSE \
                 WHERE id = $1 AND is_processing",
                &[&segment_id],
            )
            .await?;
        Ok(released > 0)
    }

    async fn reset_stuck_segments(&self, task_id: &str) -> StorageResult<u64> {
        let client = self.connect().await?;
        let reset = client
            .execute(
                "UPDATE pipeline_segments SET is_processing = FALSE \
                 WHERE task_id = $1 AND is_processing AND NOT is_processed",
                &[&task_id],
            )
            .await?;
        Ok(reset)
    }

    async fn list_segments(&self, task_id: &str) -> StorageResult<Vec<SegmentRecord>> {
        let client = self.connect().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {SEGMENT_COLUMNS} FROM pipeline_segments \
                     WHERE task_id = $1 ORDER BY ord"
                ),
                &[&task_id],
            )
            .await?;
        rows.iter().map(segment_from_row).collect()
    }

    async fn open_step(&self, task_id: &str, stage: &str) -> StorageResult<StepRecord> {
        let mut client = self.connect().await?;
        let tx = client.transaction().await?;

        let existing = tx
            .query_opt(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM pipeline_steps \
                     WHERE task_id = $1 AND stage = $2 AND status = $3 \
                     ORDER BY id DESC LIMIT 1 FOR UPDATE"
                ),
                &[&task_id, &stage, &StepStatus::InProgress.as_str()],
            )
            .await?;
        let row = match existing {
            Some(row) => row,
            None => {
                tx.query_one(
                    &format!(
                        "INSERT INTO pipeline_steps (task_id, stage, status, started_at) \
                         VALUES ($1, $2, $3, $4) RETURNING {STEP_COLUMNS}"
                    ),
                    &[
                        &task_id,
                        &stage,
                        &StepStatus::InProgress.as_str(),
                        &Utc::now(),
                    ],
                )
                .await?
            }
        };
        let step = step_from_row(&row)?;

        tx.commit().await?;
        Ok(step)
    }

    async fn finish_step(
        &self,
        step_id: i64,
        status: StepStatus,
        error: Option<&str>,
    ) -> StorageResult<()> {
        let client = self.connect().await?;
        client
            .execute(
                "UPDATE pipeline_steps SET status = $2, finished_at = $3, error = $4 \
                 WHERE id = $1",
                &[&step_id, &status.as_str(), &Utc::now(), &error],
            )
            .await?;
        Ok(())
    }

    async fn list_steps(&self, task_id: &str) -> StorageResult<Vec<StepRecord>> {
        let client = self.connect().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM pipeline_steps \
                     WHERE task_id = $1 ORDER BY id"
                ),
                &[&task_id],
            )
            .await?;
        rows.iter().map(step_from_row).collect()
    }
}
