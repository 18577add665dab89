//! Task scheduler
//!
//! [`TaskManager`] owns the worker pool of one task family. A scan lists the family's
//! unfinished tasks and spawns one worker per task that is not already owned by a
//! worker. Workers wait on a counting semaphore before touching the task, then call
//! [`StageMachine::advance`] until the task is terminal, fails to advance, or stops
//! making progress.

use crate::config::SchedulerConfig;
use crate::continuation::prepare_continuation;
use crate::error::{EngineError, EngineResult};
use crate::family::TaskFamily;
use crate::machine::{StageMachine, TaskSnapshot};
use crate::stage::PipelineStage;
use crate::stagnation::{ProgressMarker, StagnationGuard};
use speech_tasks_storage::{NewTask, SegmentRecord, StepRecord, TaskStore};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type ScanFuture = Pin<Box<dyn Future<Output = EngineResult<ScanReport>> + Send>>;

/// What one scan did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Unfinished tasks read from the store
    pub scanned: usize,
    /// Workers spawned
    pub dispatched: usize,
    /// Tasks skipped because a worker already owns them
    pub already_running: usize,
    /// Tasks skipped because they are waiting out a stagnation backoff
    pub deferred: usize,
    /// True when another scan was running and this one did nothing
    pub skipped: bool,
}

/// Releases the scan flag when a scan ends, including on error
struct ScanFlag<'a>(&'a AtomicBool);

impl<'a> ScanFlag<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for ScanFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type TaskSet = Arc<Mutex<HashSet<String>>>;

fn lock(tasks: &TaskSet) -> MutexGuard<'_, HashSet<String>> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a task from the in-flight set when its worker exits
struct InFlightGuard {
    in_flight: TaskSet,
    task_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.task_id);
    }
}

struct ManagerInner<F: TaskFamily> {
    family: Arc<F>,
    store: Arc<dyn TaskStore>,
    machine: StageMachine<F>,
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    in_flight: TaskSet,
    /// Tasks whose stuck claims were already reset by this manager
    recovered: TaskSet,
    scanning: AtomicBool,
    stagnation: StagnationGuard,
    shutdown: CancellationToken,
}

impl<F: TaskFamily> ManagerInner<F> {
    fn scan(self: Arc<Self>) -> ScanFuture {
        Box::pin(async move {
            let Some(_flag) = ScanFlag::acquire(&self.scanning) else {
                debug!(family = self.family.name(), "scan already running");
                return Ok(ScanReport {
                    skipped: true,
                    ..ScanReport::default()
                });
            };

            let pending = self.store.list_pending(self.family.name()).await?;
            let mut report = ScanReport {
                scanned: pending.len(),
                ..ScanReport::default()
            };

            for task in pending {
                if self.stagnation.is_deferred(&task.id).await {
                    report.deferred += 1;
                    continue;
                }
                if !lock(&self.in_flight).insert(task.id.clone()) {
                    report.already_running += 1;
                    continue;
                }

                let membership = InFlightGuard {
                    in_flight: Arc::clone(&self.in_flight),
                    task_id: task.id.clone(),
                };
                let inner = Arc::clone(&self);
                tokio::spawn(async move {
                    inner.run_worker(&membership.task_id).await;
                    drop(membership);
                });
                report.dispatched += 1;
            }

            if report.dispatched > 0 {
                debug!(
                    family = self.family.name(),
                    scanned = report.scanned,
                    dispatched = report.dispatched,
                    "scan dispatched workers"
                );
            }
            Ok(report)
        })
    }

    async fn run_worker(self: &Arc<Self>, task_id: &str) {
        let _permit = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return,
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        // Claims left by a crash are reset before this manager's first claim only
        if lock(&self.recovered).insert(task_id.to_string()) {
            if let Err(e) = self.machine.claimer().recover(task_id).await {
                lock(&self.recovered).remove(task_id);
                error!(task_id, error = %e, "failed to reset stuck claims");
                return;
            }
        }
        let mut marker = match self.store.get_task(task_id).await {
            Ok(Some(record)) => ProgressMarker::of_record(&record),
            Ok(None) => {
                self.forget(task_id).await;
                return;
            }
            Err(e) => {
                error!(task_id, error = %e, "failed to load task");
                return;
            }
        };

        loop {
            match self.machine.advance(task_id, &self.shutdown).await {
                Ok(snapshot) if snapshot.done => {
                    info!(
                        task_id,
                        family = self.family.name(),
                        stage = snapshot.stage.as_str(),
                        "task finished"
                    );
                    self.forget(task_id).await;
                    return;
                }
                Ok(snapshot) => {
                    let progress = ProgressMarker::of_snapshot(&snapshot);
                    if progress == marker {
                        info!(
                            task_id,
                            stage = snapshot.stage.as_str(),
                            backoff_ms = self.stagnation.backoff().as_millis(),
                            "no progress, deferring task"
                        );
                        self.stagnation.defer(task_id).await;
                        self.schedule_rescan();
                        return;
                    }
                    marker = progress;
                }
                Err(EngineError::Cancelled) => {
                    debug!(task_id, "worker cancelled");
                    return;
                }
                Err(e) => {
                    error!(task_id, error = %e, "advance failed, task left for next scan");
                    return;
                }
            }
        }
    }

    /// Drop per-task bookkeeping of a finished or deleted task
    async fn forget(&self, task_id: &str) {
        lock(&self.recovered).remove(task_id);
        self.stagnation.clear(task_id).await;
    }

    /// Schedule one delayed scan; calls while one is pending are coalesced
    fn schedule_rescan(self: &Arc<Self>) {
        if !self.stagnation.try_schedule_rescan() {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = inner.shutdown.cancelled() => {
                    inner.stagnation.rescan_started();
                    return;
                }
                () = tokio::time::sleep(inner.stagnation.backoff()) => {}
            }
            inner.stagnation.rescan_started();

            match Arc::clone(&inner).scan().await {
                Ok(report) if report.deferred > 0 || report.skipped => inner.schedule_rescan(),
                Ok(_) => {}
                Err(e) => warn!(family = inner.family.name(), error = %e, "delayed scan failed"),
            }
        });
    }
}

/// Worker pool and public surface for one task family
pub struct TaskManager<F: TaskFamily> {
    inner: Arc<ManagerInner<F>>,
}

impl<F: TaskFamily> Clone for TaskManager<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: TaskFamily> TaskManager<F> {
    pub fn new(family: F, store: Arc<dyn TaskStore>, config: SchedulerConfig) -> Self {
        let family = Arc::new(family);
        let concurrency = config.concurrency(family.default_concurrency());
        let machine = StageMachine::new(Arc::clone(&family), Arc::clone(&store));
        let stagnation = StagnationGuard::new(config.stagnation_backoff());

        Self {
            inner: Arc::new(ManagerInner {
                family,
                store,
                machine,
                config,
                semaphore: Arc::new(Semaphore::new(concurrency)),
                in_flight: Arc::new(Mutex::new(HashSet::new())),
                recovered: Arc::new(Mutex::new(HashSet::new())),
                scanning: AtomicBool::new(false),
                stagnation,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn family(&self) -> &F {
        &self.inner.family
    }

    #[must_use]
    pub fn machine(&self) -> &StageMachine<F> {
        &self.inner.machine
    }

    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.inner
            .config
            .concurrency(self.inner.family.default_concurrency())
    }

    /// Create a task in its initial stage, or return the id of the unfinished task
    /// with the same logical key
    pub async fn enqueue(&self, payload: F::Payload, created_by: &str) -> EngineResult<String> {
        let family = &self.inner.family;
        let task = NewTask {
            id: uuid::Uuid::new_v4().to_string(),
            family: family.name().to_string(),
            logical_key: family.logical_key(&payload),
            stage: F::Stage::initial().as_str().to_string(),
            payload: serde_json::to_value(&payload)?,
            created_by: created_by.to_string(),
        };

        let outcome = self.inner.store.insert_task(&task).await?;
        let task_id = outcome.record().id.clone();
        if outcome.is_created() {
            info!(
                task_id = %task_id,
                family = family.name(),
                logical_key = %task.logical_key,
                "task enqueued"
            );
            self.trigger_scan();
        } else {
            debug!(task_id = %task_id, "task already queued for this key");
        }
        Ok(task_id)
    }

    pub async fn get_status(&self, task_id: &str) -> EngineResult<Option<TaskSnapshot<F::Stage>>> {
        self.inner
            .store
            .get_task(task_id)
            .await?
            .as_ref()
            .map(TaskSnapshot::from_record)
            .transpose()
    }

    /// All tasks of this family, newest first
    pub async fn list(&self) -> EngineResult<Vec<TaskSnapshot<F::Stage>>> {
        self.inner
            .store
            .list_tasks(Some(self.inner.family.name()))
            .await?
            .iter()
            .map(TaskSnapshot::from_record)
            .collect()
    }

    /// Remove a task with its segments and steps
    ///
    /// Best effort while a worker owns the task: the worker stops at its next read.
    pub async fn delete(&self, task_id: &str) -> EngineResult<bool> {
        let deleted = self.inner.store.delete_task(task_id).await?;
        self.inner.forget(task_id).await;
        if deleted {
            info!(task_id, "task deleted");
        }
        Ok(deleted)
    }

    pub async fn steps(&self, task_id: &str) -> EngineResult<Vec<StepRecord>> {
        Ok(self.inner.store.list_steps(task_id).await?)
    }

    pub async fn segments(&self, task_id: &str) -> EngineResult<Vec<SegmentRecord>> {
        Ok(self.inner.store.list_segments(task_id).await?)
    }

    /// Pick up unfinished work after a restart
    pub async fn resume_incomplete(&self) -> EngineResult<ScanReport> {
        info!(family = self.inner.family.name(), "resuming incomplete tasks");
        self.process_queue_once().await
    }

    pub async fn process_queue_once(&self) -> EngineResult<ScanReport> {
        Arc::clone(&self.inner).scan().await
    }

    /// Run a scan in the background
    pub fn trigger_scan(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = Arc::clone(&inner).scan().await {
                warn!(family = inner.family.name(), error = %e, "triggered scan failed");
            }
        });
    }

    /// Make a failed task runnable again; see [`prepare_continuation`]
    pub async fn continue_task(
        &self,
        task_id: &str,
    ) -> EngineResult<Option<TaskSnapshot<F::Stage>>> {
        let reset_claims = !self.is_in_flight(task_id);
        let snapshot =
            prepare_continuation::<F::Stage>(self.inner.store.as_ref(), task_id, reset_claims)
                .await?;

        if let Some(snapshot) = &snapshot {
            if !snapshot.done {
                self.inner.stagnation.clear(task_id).await;
                self.trigger_scan();
            }
        }
        Ok(snapshot)
    }

    #[must_use]
    pub fn is_in_flight(&self, task_id: &str) -> bool {
        lock(&self.inner.in_flight).contains(task_id)
    }

    /// True while the task sits out a stagnation backoff
    pub async fn is_deferred(&self, task_id: &str) -> bool {
        self.inner.stagnation.is_deferred(task_id).await
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    /// Token that stops the host loop and cancels running workers
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Host loop: resume once, then scan on every tick until shutdown
    pub async fn run(&self) {
        let family = self.inner.family.name();
        info!(
            family,
            max_concurrent = self.max_concurrent(),
            scan_interval_ms = self.inner.config.scan_interval_ms,
            "starting task scheduler"
        );

        if let Err(e) = self.resume_incomplete().await {
            warn!(family, error = %e, "resume scan failed");
        }

        let mut ticker = tokio::time::interval(self.inner.config.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                () = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.process_queue_once().await {
                        warn!(family, error = %e, "scheduled scan failed");
                    }
                }
            }
        }

        info!(family, "task scheduler stopped");
    }
}
