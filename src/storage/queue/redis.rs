use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use super::PriorityQueue;

/// Shortest wait passed to BRPOP. Redis treats a zero timeout as "block forever".
const MIN_BLOCK: Duration = Duration::from_millis(1);

pub struct RedisPriorityQueue {
    conn: ConnectionManager,
}

impl RedisPriorityQueue {
    pub async fn new(redis_url: &str) -> Result<Self> {
        info!("Connecting priority queue to Redis");
        let client = redis::Client::open(redis_url).context("Invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl PriorityQueue for RedisPriorityQueue {
    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{}:*", prefix)).await?;
        Ok(keys)
    }

    async fn len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn pop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn.brpop(key, block_seconds(timeout)).await?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn push(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: usize = conn.lpush(key, value).await?;
        Ok(())
    }
}

fn block_seconds(timeout: Duration) -> f64 {
    timeout.max(MIN_BLOCK).as_secs_f64()
}
