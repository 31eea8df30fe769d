use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::storage::task::TaskStore;

/// Hands tasks abandoned by crashed workers back to the pool.
#[derive(Clone)]
pub struct StalledTaskRecovery {
    store: Arc<dyn TaskStore>,
}

impl StalledTaskRecovery {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Resets `processing` rows untouched for longer than `older_than`.
    pub async fn recover_stalled(&self, older_than: Duration) -> Result<u64> {
        let cutoff = stalled_cutoff(Utc::now(), older_than)?;
        let recovered = self.store.recover_stalled(cutoff).await?;
        if recovered > 0 {
            info!("Recovered {} stalled tasks", recovered);
        }
        Ok(recovered)
    }
}

/// `now - older_than`, or an error when that instant cannot be represented.
pub fn stalled_cutoff(now: DateTime<Utc>, older_than: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(older_than)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| anyhow!("Stalled threshold {:?} is out of range", older_than))
}
