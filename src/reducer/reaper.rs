//! Periodic cleanup for expired job claims.
//!
//! The `ClaimReaper` runs as a background task in every replica. Deletes are
//! idempotent, so concurrent reapers on a shared store are harmless.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use super::{JobReducer, ReapFilter};

/// Default interval between reaping passes.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Background task that releases claims past their retention window.
pub struct ClaimReaper {
    reducer: Arc<JobReducer>,
    filter: ReapFilter,
    interval: Duration,
}

impl ClaimReaper {
    /// Create a reaper that releases claims older than `filter.older_than`.
    pub fn new(reducer: Arc<JobReducer>, filter: ReapFilter) -> Self {
        Self {
            reducer,
            filter,
            interval: DEFAULT_REAP_INTERVAL,
        }
    }

    /// Set custom cleanup interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawn the reaper as a background task.
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                if let Err(e) = self.run_once().await {
                    warn!(error = %e, "Claim reaper failed to release expired claims");
                }
            }
        })
    }

    /// Run one reaping pass.
    pub async fn run_once(&self) -> super::Result<u64> {
        self.reducer.release_expired(self.filter).await
    }
}
