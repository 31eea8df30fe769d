use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{Messenger, TaskProcessor};
use crate::schedule::types::{Platform, Task, TaskResult, TaskType};

fn require_handle(task: &Task) -> Result<&str> {
    task.handle()
        .ok_or_else(|| anyhow!("Missing handle in task payload"))
}

/// One-shot DM proving the platform account can reach the user.
#[derive(Clone)]
pub struct VerificationDmProcessor {
    messenger: Arc<dyn Messenger>,
}

impl VerificationDmProcessor {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self { messenger }
    }
}

#[async_trait]
impl TaskProcessor for VerificationDmProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::VerificationDm
    }

    async fn process(&self, task: &Task) -> Result<TaskResult> {
        let handle = require_handle(task)?;
        info!(task_id = %task.id, handle, platform = %task.platform, "Sending verification DM");
        self.messenger.send_dm(task.platform, handle, None).await
    }
}

/// Weekly digest telling the user how many of their former follows moved to
/// the platform.
#[derive(Clone)]
pub struct RecommendationDigestProcessor {
    messenger: Arc<dyn Messenger>,
}

impl RecommendationDigestProcessor {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self { messenger }
    }

    pub fn digest_message(count: u64, platform: Platform) -> String {
        format!(
            "There are {} people you followed on Twitter who are now on {}! Find them on openportability.org",
            count,
            platform.display_name()
        )
    }
}

#[async_trait]
impl TaskProcessor for RecommendationDigestProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::RecommendationDigest
    }

    async fn process(&self, task: &Task) -> Result<TaskResult> {
        let handle = require_handle(task)?;
        let count = task
            .payload
            .get("recommendation_count")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        if count == 0 {
            info!(task_id = %task.id, "No recommendations for user {}, skipping digest", task.user_id);
            return Ok(TaskResult::skipped("No recommendations to send")
                .with_field("recommendation_count", Value::from(0u64)));
        }

        let message = Self::digest_message(count, task.platform);
        info!(task_id = %task.id, handle, count, "Sending recommendation digest");
        let result = self
            .messenger
            .send_dm(task.platform, handle, Some(&message))
            .await?;

        Ok(result.with_field("recommendation_count", Value::from(count)))
    }
}
