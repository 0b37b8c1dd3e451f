//! Retention sweep: terminal tasks are kept for a configurable number of
//! days, then deleted.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::task::JoinHandle;

use crate::config::RetentionConfig;
use crate::storage::Storage;

/// Periodic deletion of old terminal tasks.
pub struct RetentionSweep {
    storage: Storage,
    config: RetentionConfig,
}

impl RetentionSweep {
    pub fn new(storage: Storage, config: RetentionConfig) -> Self {
        Self { storage, config }
    }

    /// One pass; returns how many rows were deleted.
    pub async fn run_once(&self) -> u64 {
        let cutoff = Utc::now() - Duration::days(i64::from(self.config.task_retention_days));
        match self.storage.tasks.delete_terminal_older_than(cutoff).await {
            Ok(deleted) => {
                if deleted > 0 {
                    tracing::info!(deleted, "retention sweep removed old tasks");
                }
                deleted
            }
            Err(err) => {
                tracing::error!(error = %err, "retention sweep failed");
                0
            }
        }
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let sweep = Arc::clone(self);
        let interval = std::time::Duration::from_millis(sweep.config.sweep_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                sweep.run_once().await;
            }
        })
    }
}

impl std::fmt::Debug for RetentionSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionSweep")
            .field("config", &self.config)
            .finish()
    }
}
