use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use super::{Outcome, RetryExecutor, StalledTaskRecovery};
use crate::config::WorkerConfig;
use crate::schedule::source::TaskConsumer;
use crate::schedule::types::Task;
use crate::storage::task::TaskStore;

/// Timings and limits of one worker loop.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub idle_interval: Duration,
    pub busy_interval: Duration,
    pub error_backoff_factor: u32,
    pub stalled_threshold: Duration,
    pub max_attempts: u32,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            idle_interval: config.idle_interval,
            busy_interval: config.busy_interval,
            error_backoff_factor: config.error_backoff_factor,
            stalled_threshold: config.stalled_threshold,
            max_attempts: config.max_attempts,
            jitter_min: config.jitter_min,
            jitter_max: config.jitter_max,
        }
    }
}

impl WorkerSettings {
    fn error_pause(&self) -> Duration {
        self.idle_interval.saturating_mul(self.error_backoff_factor.max(1))
    }

    fn jitter(&self) -> Duration {
        if self.jitter_max <= self.jitter_min {
            return self.jitter_min;
        }
        let min = self.jitter_min.as_millis() as u64;
        let max = self.jitter_max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

pub struct TaskWorker {
    worker_id: String,
    consumer: TaskConsumer,
    executor: RetryExecutor,
    recovery: StalledTaskRecovery,
    store: Arc<dyn TaskStore>,
    settings: WorkerSettings,
}

impl TaskWorker {
    pub fn new(
        worker_id: impl Into<String>,
        consumer: TaskConsumer,
        executor: RetryExecutor,
        store: Arc<dyn TaskStore>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            consumer,
            executor,
            recovery: StalledTaskRecovery::new(store.clone()),
            store,
            settings,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Loops until `shutdown` flips to true. A task already executing always
    /// runs to completion; only the pauses between iterations are interrupted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, "Worker started");
        let mut consecutive_errors: u32 = 0;

        while !*shutdown.borrow() {
            if let Err(e) = self
                .recovery
                .recover_stalled(self.settings.stalled_threshold)
                .await
            {
                warn!(worker_id = %self.worker_id, "Stalled task recovery failed: {}", e);
            }

            // spreads out sibling workers that woke up together
            if !pause(self.settings.jitter(), &mut shutdown).await {
                break;
            }

            let wait = match self.process_next_task().await {
                Ok(true) => {
                    consecutive_errors = 0;
                    self.settings.busy_interval
                }
                Ok(false) => {
                    consecutive_errors = 0;
                    self.settings.idle_interval
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(
                        worker_id = %self.worker_id,
                        consecutive_errors,
                        "Error processing task: {}", e
                    );
                    self.settings.error_pause()
                }
            };

            if !pause(wait, &mut shutdown).await {
                break;
            }
        }

        info!(worker_id = %self.worker_id, "Worker stopped");
    }

    /// Runs at most one task. `Ok(false)` means there was nothing to do.
    pub async fn process_next_task(&self) -> Result<bool> {
        let task = match self.consumer.next_task(&self.worker_id).await {
            Some(task) => task,
            None => return Ok(false),
        };

        if task.is_deferred(Utc::now()) {
            info!(
                worker_id = %self.worker_id,
                task_id = %task.id,
                "Task is scheduled for later ({:?}), deferring it",
                task.scheduled_for
            );
            self.defer(&task).await?;
            return Ok(true);
        }

        let execution = self
            .executor
            .run_with_retry(&task, &self.worker_id, self.settings.max_attempts)
            .await?;

        match &execution.outcome {
            Outcome::Completed { attempts, .. } => {
                info!(worker_id = %self.worker_id, task_id = %task.id, attempts, "Finished task")
            }
            Outcome::Failed { attempts, .. } => {
                warn!(worker_id = %self.worker_id, task_id = %task.id, attempts, "Gave up on task")
            }
        }
        if let Some(successor) = &execution.successor {
            info!(task_id = %task.id, successor_id = %successor.id, "Queued next occurrence");
        }

        Ok(true)
    }

    /// Hands a not-yet-due queue item to the store so the fallback claim picks
    /// it up once it is due. Rows that already started or finished are left
    /// alone and the queue entry is dropped.
    async fn defer(&self, task: &Task) -> Result<()> {
        if self.store.release(&task.id).await? {
            return Ok(());
        }
        if self.store.insert_pending(task).await? {
            info!(worker_id = %self.worker_id, task_id = %task.id, "Stored deferred task");
            return Ok(());
        }
        warn!(
            worker_id = %self.worker_id,
            task_id = %task.id,
            "Dropping stale queue entry, task already started or finished"
        );
        Ok(())
    }
}

/// Sleeps for `duration` unless shutdown is requested first. Returns whether
/// the loop should keep going.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if duration.is_zero() {
        return !*shutdown.borrow();
    }
    tokio::select! {
        _ = sleep(duration) => !*shutdown.borrow(),
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}
