use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub mod memory;
pub mod redis;

pub use memory::InMemoryPriorityQueue;
pub use self::redis::RedisPriorityQueue;

/// Date-partitioned lists of serialized tasks written by the web application.
///
/// Producers push on the left and consumers pop on the right, so each list
/// drains oldest entry first.
#[async_trait]
pub trait PriorityQueue: Send + Sync + 'static {
    /// Every key under `prefix:`, in no particular order.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
    async fn len(&self, key: &str) -> Result<usize>;
    /// Pops the oldest entry, waiting at most `timeout` for one to appear.
    async fn pop(&self, key: &str, timeout: Duration) -> Result<Option<String>>;
    async fn push(&self, key: &str, value: &str) -> Result<()>;
}
