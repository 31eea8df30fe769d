use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use super::TaskSource;
use crate::schedule::types::Task;
use crate::storage::task::TaskStore;

/// Durable path: the oldest due `pending` row, claimed atomically.
pub struct FallbackSource {
    store: Arc<dyn TaskStore>,
}

impl FallbackSource {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// `None` when nothing is due, when another worker won the row, or when
    /// the store failed.
    pub async fn claim_next(&self, worker_id: &str) -> Option<Task> {
        match self.store.claim_next(worker_id, Utc::now()).await {
            Ok(Some(task)) => {
                info!(worker_id, task_id = %task.id, "Claimed task from store");
                Some(task)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(worker_id, "Failed to claim task from store: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl TaskSource for FallbackSource {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn try_next(&self, worker_id: &str) -> Option<Task> {
        self.claim_next(worker_id).await
    }
}
