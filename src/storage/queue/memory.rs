use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::PriorityQueue;

/// Process-local queue with the same push/pop ends as the Redis lists.
///
/// `pop` never blocks: callers only pop keys they saw non-empty.
#[derive(Default)]
pub struct InMemoryPriorityQueue {
    lists: RwLock<HashMap<String, VecDeque<String>>>,
}

impl InMemoryPriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PriorityQueue for InMemoryPriorityQueue {
    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let lists = self.lists.read().map_err(|e| anyhow!(e.to_string()))?;
        let pattern = format!("{}:", prefix);
        Ok(lists
            .iter()
            .filter(|(key, list)| key.starts_with(&pattern) && !list.is_empty())
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn len(&self, key: &str) -> Result<usize> {
        let lists = self.lists.read().map_err(|e| anyhow!(e.to_string()))?;
        Ok(lists.get(key).map_or(0, VecDeque::len))
    }

    async fn pop(&self, key: &str, _timeout: Duration) -> Result<Option<String>> {
        let mut lists = self.lists.write().map_err(|e| anyhow!(e.to_string()))?;
        Ok(lists.get_mut(key).and_then(VecDeque::pop_back))
    }

    async fn push(&self, key: &str, value: &str) -> Result<()> {
        let mut lists = self.lists.write().map_err(|e| anyhow!(e.to_string()))?;
        lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }
}
