use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::TaskSource;
use crate::schedule::types::{Platform, Task, TaskStatus, TaskType};
use crate::storage::queue::PriorityQueue;
use crate::storage::task::TaskStore;

/// Flat JSON item the web application pushes onto `<prefix>:<YYYY-MM-DD>`.
#[derive(Debug, Deserialize)]
struct QueuedTask {
    id: String,
    user_id: String,
    task_type: TaskType,
    platform: Platform,
    handle: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    scheduled_for: Option<DateTime<Utc>>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl QueuedTask {
    fn into_task(self, worker_id: &str, now: DateTime<Utc>) -> Task {
        let mut payload = self.extra;
        // the producer's own status is stale once the item left the list
        payload.remove("status");
        payload.insert("handle".to_string(), Value::String(self.handle));

        Task {
            id: self.id,
            user_id: self.user_id,
            status: TaskStatus::Processing,
            task_type: self.task_type,
            platform: self.platform,
            payload: Value::Object(payload),
            result: None,
            error_log: None,
            worker_id: Some(worker_id.to_string()),
            created_at: self.created_at.unwrap_or(now),
            updated_at: now,
            scheduled_for: self.scheduled_for,
        }
    }
}

/// Low-latency path: date-partitioned lists, newest day first.
pub struct PrioritySource {
    queue: Arc<dyn PriorityQueue>,
    store: Arc<dyn TaskStore>,
    prefix: String,
    pop_timeout: Duration,
}

impl PrioritySource {
    pub fn new(
        queue: Arc<dyn PriorityQueue>,
        store: Arc<dyn TaskStore>,
        prefix: impl Into<String>,
        pop_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            prefix: prefix.into(),
            pop_timeout,
        }
    }

    /// Pops one task, or `None` when every list is empty or the queue is unreachable.
    pub async fn try_pop(&self, worker_id: &str) -> Option<Task> {
        let mut keys = match self.queue.keys(&self.prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(worker_id, "Priority queue unavailable: {}", e);
                return None;
            }
        };
        keys.sort_unstable_by(|a, b| b.cmp(a));

        for key in keys {
            let raw = match self.pop_from(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker_id, key = %key, "Failed to read priority queue: {}", e);
                    continue;
                }
            };

            let queued = match serde_json::from_str::<QueuedTask>(&raw) {
                Ok(queued) => queued,
                Err(e) => {
                    warn!(worker_id, key = %key, "Dropping malformed queue item: {}", e);
                    continue;
                }
            };

            let now = Utc::now();
            let task = queued.into_task(worker_id, now);
            info!(worker_id, task_id = %task.id, key = %key, "Popped task from priority queue");
            // a task that is not due yet goes straight back to pending
            if !task.is_deferred(now) {
                self.mark_processing(&task.id, worker_id);
            }
            return Some(task);
        }

        None
    }

    async fn pop_from(&self, key: &str) -> Result<Option<String>> {
        if self.queue.len(key).await? == 0 {
            return Ok(None);
        }
        self.queue.pop(key, self.pop_timeout).await
    }

    /// Mirrors the pop into the durable row without holding up execution.
    fn mark_processing(&self, task_id: &str, worker_id: &str) {
        let store = self.store.clone();
        let task_id = task_id.to_string();
        let worker_id = worker_id.to_string();

        tokio::spawn(async move {
            match store.mark_processing(&task_id, &worker_id).await {
                Ok(true) => debug!(worker_id = %worker_id, task_id = %task_id, "Marked queued task as processing"),
                Ok(false) => debug!(worker_id = %worker_id, task_id = %task_id, "No pending row to mark for queued task"),
                Err(e) => warn!(worker_id = %worker_id, task_id = %task_id, "Failed to mark queued task as processing: {}", e),
            }
        });
    }
}

#[async_trait]
impl TaskSource for PrioritySource {
    fn name(&self) -> &'static str {
        "priority"
    }

    async fn try_next(&self, worker_id: &str) -> Option<Task> {
        self.try_pop(worker_id).await
    }
}
