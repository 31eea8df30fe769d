use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::TaskStore;
use crate::schedule::types::{NewTask, Task, TaskResult, TaskStatus};

/// Process-local store. Rows keep insertion order, which breaks `created_at` ties.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<Vec<Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tasks<T>(&self, f: impl FnOnce(&mut Vec<Task>) -> T) -> Result<T> {
        let mut tasks = self.tasks.lock().map_err(|e| anyhow!(e.to_string()))?;
        Ok(f(&mut tasks))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &NewTask) -> Result<Task> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            user_id: task.user_id.clone(),
            status: task.status,
            task_type: task.task_type,
            platform: task.platform,
            payload: task.payload.clone(),
            result: None,
            error_log: None,
            worker_id: None,
            created_at: now,
            updated_at: now,
            scheduled_for: task.scheduled_for,
        };
        self.with_tasks(|tasks| tasks.push(task.clone()))?;
        Ok(task)
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        self.with_tasks(|tasks| tasks.iter().find(|t| t.id == task_id).cloned())
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Task>> {
        self.with_tasks(|tasks| {
            let next = tasks
                .iter_mut()
                .filter(|t| t.status == TaskStatus::Pending && !t.is_deferred(now))
                .min_by_key(|t| t.created_at)?;
            next.status = TaskStatus::Processing;
            next.worker_id = Some(worker_id.to_string());
            next.updated_at = now;
            Some(next.clone())
        })
    }

    async fn mark_processing(&self, task_id: &str, worker_id: &str) -> Result<bool> {
        self.with_tasks(|tasks| {
            match tasks.iter_mut().find(|t| {
                t.id == task_id && matches!(t.status, TaskStatus::Pending | TaskStatus::Waiting)
            }) {
                Some(task) => {
                    task.status = TaskStatus::Processing;
                    task.worker_id = Some(worker_id.to_string());
                    task.updated_at = Utc::now();
                    true
                }
                None => false,
            }
        })
    }

    async fn touch(&self, task_id: &str) -> Result<()> {
        self.with_tasks(|tasks| {
            if let Some(task) = tasks
                .iter_mut()
                .find(|t| t.id == task_id && t.status == TaskStatus::Processing)
            {
                task.updated_at = Utc::now();
            }
        })
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&TaskResult>,
        error_log: Option<&str>,
    ) -> Result<bool> {
        self.with_tasks(|tasks| match tasks.iter_mut().find(|t| t.id == task_id) {
            Some(task) => {
                task.status = status;
                task.result = result.cloned();
                task.error_log = error_log.map(str::to_string);
                if status == TaskStatus::Pending {
                    task.worker_id = None;
                }
                task.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn release(&self, task_id: &str) -> Result<bool> {
        self.with_tasks(|tasks| {
            match tasks.iter_mut().find(|t| {
                t.id == task_id && matches!(t.status, TaskStatus::Pending | TaskStatus::Waiting)
            }) {
                Some(task) => {
                    task.status = TaskStatus::Pending;
                    task.worker_id = None;
                    task.updated_at = Utc::now();
                    true
                }
                None => false,
            }
        })
    }

    async fn insert_pending(&self, task: &Task) -> Result<bool> {
        self.with_tasks(|tasks| {
            if tasks.iter().any(|t| t.id == task.id) {
                return false;
            }
            tasks.push(Task {
                status: TaskStatus::Pending,
                result: None,
                error_log: None,
                worker_id: None,
                updated_at: Utc::now(),
                ..task.clone()
            });
            true
        })
    }

    async fn recover_stalled(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.with_tasks(|tasks| {
            let now = Utc::now();
            let mut recovered = 0;
            for task in tasks
                .iter_mut()
                .filter(|t| t.status == TaskStatus::Processing && t.updated_at < cutoff)
            {
                task.status = TaskStatus::Pending;
                task.worker_id = None;
                task.updated_at = now;
                recovered += 1;
            }
            recovered
        })
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.with_tasks(|tasks| tasks.iter().filter(|t| t.status == status).cloned().collect())
    }
}
