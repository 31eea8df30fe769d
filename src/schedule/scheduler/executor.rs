use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use super::Rescheduler;
use crate::schedule::processors::TaskProcessor;
use crate::schedule::types::{Task, TaskResult, TaskStatus, TaskType};
use crate::storage::task::TaskStore;

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed { result: TaskResult, attempts: u32 },
    Failed { error: String, attempts: u32 },
}

impl Outcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Outcome::Completed { attempts, .. } | Outcome::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed { .. })
    }
}

/// What happened to one task, plus the follow-up record if one was queued.
#[derive(Debug, Clone)]
pub struct Execution {
    pub outcome: Outcome,
    pub successor: Option<Task>,
}

/// Delay before the attempt after `attempt`: `base * 2^(attempt - 1)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.checked_mul(factor).unwrap_or(Duration::MAX)
}

/// Longest a single processor call may run before it counts as a failed attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(45);

/// Runs a claimed task through its processor, retrying with exponential
/// backoff, and records the terminal status.
pub struct RetryExecutor {
    store: Arc<dyn TaskStore>,
    processors: HashMap<TaskType, Box<dyn TaskProcessor>>,
    rescheduler: Rescheduler,
    backoff_base: Duration,
    attempt_timeout: Duration,
}

impl RetryExecutor {
    pub fn new(store: Arc<dyn TaskStore>, backoff_base: Duration) -> Self {
        Self {
            rescheduler: Rescheduler::new(store.clone()),
            store,
            processors: HashMap::new(),
            backoff_base,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn register_processor(&mut self, processor: Box<dyn TaskProcessor>) {
        let task_type = processor.task_type();
        info!("Registering processor for task type: {}", task_type);
        self.processors.insert(task_type, processor);
    }

    pub async fn run_with_retry(&self, task: &Task, worker_id: &str, max_attempts: u32) -> Result<Execution> {
        let max_attempts = max_attempts.max(1);
        let mut last_error = String::new();
        let mut last_result = None;

        for attempt in 1..=max_attempts {
            // keeps stalled recovery off a task that is sitting in backoff
            if let Err(e) = self.store.touch(&task.id).await {
                warn!(worker_id, task_id = %task.id, "Failed to refresh task heartbeat: {}", e);
            }

            info!(worker_id, task_id = %task.id, attempt, max_attempts, "Processing {} task", task.task_type);

            match self.attempt(task).await {
                Ok(result) if result.success => {
                    return self.complete(task, worker_id, result, attempt).await;
                }
                Ok(result) => {
                    last_error = result
                        .error
                        .clone()
                        .unwrap_or_else(|| "Task reported failure".to_string());
                    last_result = Some(result);
                }
                Err(e) => {
                    last_error = e.to_string();
                    last_result = None;
                }
            }

            warn!(worker_id, task_id = %task.id, attempt, "Attempt failed: {}", last_error);

            if attempt < max_attempts {
                sleep(backoff_delay(self.backoff_base, attempt)).await;
            }
        }

        self.fail(task, worker_id, last_result, last_error, max_attempts).await
    }

    async fn attempt(&self, task: &Task) -> Result<TaskResult> {
        let processor = self
            .processors
            .get(&task.task_type)
            .ok_or_else(|| anyhow!("No processor found for task type: {}", task.task_type))?;
        match timeout(self.attempt_timeout, processor.process(task)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("Attempt timed out after {:?}", self.attempt_timeout)),
        }
    }

    async fn complete(&self, task: &Task, worker_id: &str, result: TaskResult, attempts: u32) -> Result<Execution> {
        if !self
            .store
            .update_status(&task.id, TaskStatus::Completed, Some(&result), None)
            .await?
        {
            warn!(worker_id, task_id = %task.id, "No stored record to mark completed");
        }
        info!(worker_id, task_id = %task.id, attempts, skipped = result.skipped, "Task completed");

        let successor = self.reschedule(task).await;
        Ok(Execution {
            outcome: Outcome::Completed { result, attempts },
            successor,
        })
    }

    async fn fail(
        &self,
        task: &Task,
        worker_id: &str,
        last_result: Option<TaskResult>,
        error: String,
        attempts: u32,
    ) -> Result<Execution> {
        let result = last_result.unwrap_or_else(|| TaskResult::failure(error.clone()));
        if !self
            .store
            .update_status(&task.id, TaskStatus::Failed, Some(&result), Some(&error))
            .await?
        {
            warn!(worker_id, task_id = %task.id, "No stored record to mark failed");
        }
        error!(worker_id, task_id = %task.id, attempts, "Task failed after all attempts: {}", error);

        let successor = self.reschedule(task).await;
        Ok(Execution {
            outcome: Outcome::Failed { error, attempts },
            successor,
        })
    }

    async fn reschedule(&self, task: &Task) -> Option<Task> {
        match self.rescheduler.schedule_next(task).await {
            Ok(successor) => successor,
            Err(e) => {
                error!(task_id = %task.id, "Failed to schedule next occurrence: {}", e);
                None
            }
        }
    }
}
