use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::info;

use crate::schedule::types::{NewTask, Task};
use crate::storage::task::TaskStore;

/// Queues the next occurrence of recurring task types.
#[derive(Clone)]
pub struct Rescheduler {
    store: Arc<dyn TaskStore>,
}

impl Rescheduler {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Inserts a fresh pending record one interval after the finished run.
    /// The finished record itself is left untouched.
    pub async fn schedule_next(&self, task: &Task) -> Result<Option<Task>> {
        let Some(interval) = task.task_type.recurrence() else {
            return Ok(None);
        };

        let next_at = task.scheduled_for.unwrap_or_else(Utc::now) + interval;
        let successor = self
            .store
            .insert(
                &NewTask::pending(task.user_id.clone(), task.task_type, task.platform, task.payload.clone())
                    .scheduled_for(next_at),
            )
            .await?;

        info!(
            task_id = %task.id,
            successor_id = %successor.id,
            "Scheduled next {} for {}",
            task.task_type,
            next_at
        );
        Ok(Some(successor))
    }
}
