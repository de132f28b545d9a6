//! Job reducer - distributed at-most-once execution gate.
//!
//! Every replica of the control plane computes the same job id for the same
//! logical occurrence and tries to insert a claim for it. The shared store's
//! uniqueness constraint guarantees a single winner; everyone else is told
//! `false` and skips the occurrence.
//!
//! The reducer knows nothing about what the job does. Claims are never
//! deleted by the winner: the uniqueness constraint alone blocks the losers,
//! and the reaper removes claims once they are past their retention window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::utils::clock::{saturating_add, saturating_sub, Clock, SystemClock};

pub mod memory;
pub mod reaper;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryClaimStore;
pub use reaper::ClaimReaper;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteClaimStore;

/// Default time a claim keeps blocking other replicas.
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(60 * 60);

/// Result type for reducer operations.
pub type Result<T> = std::result::Result<T, ReducerError>;

/// Errors that can occur while claiming or reaping.
#[derive(Debug, thiserror::Error)]
pub enum ReducerError {
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Claim store unavailable: {0}")]
    Unavailable(String),
}

/// Persisted ownership of one occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct JobClaim {
    pub job_id: String,
    pub metadata: serde_json::Value,
    pub claimed_at: DateTime<Utc>,
    /// Until this instant the claim must survive reaping.
    pub expires_at: DateTime<Utc>,
}

/// Selects claims eligible for reaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapFilter {
    /// Only claims older than this are reaped.
    pub older_than: Duration,
}

impl ReapFilter {
    pub fn older_than(older_than: Duration) -> Self {
        Self { older_than }
    }
}

/// Bounds passed to the store; both must hold for a claim to be deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryBounds {
    /// Delete only claims whose validity ended at or before this instant.
    pub expired_by: DateTime<Utc>,
    /// Delete only claims made strictly before this instant.
    pub claimed_before: DateTime<Utc>,
}

/// Shared persistent store with atomic insert-if-absent on `job_id`.
///
/// Implementations:
/// - `SqliteClaimStore`: SQLite table with a primary key on `job_id`
/// - `MemoryClaimStore`: In-memory map for tests and single-instance setups
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Insert the claim.
    ///
    /// Returns `Ok(false)` when a claim with the same `job_id` already exists;
    /// that condition is contention, not an error.
    async fn insert(&self, claim: &JobClaim) -> Result<bool>;

    /// Delete claims matching both bounds. Returns the number deleted.
    async fn delete_expired(&self, bounds: ExpiryBounds) -> Result<u64>;
}

/// Mutual-exclusion primitive over logical job ids.
pub struct JobReducer {
    store: Arc<dyn ClaimStore>,
    validity: Duration,
    clock: Arc<dyn Clock>,
}

impl JobReducer {
    /// Create a reducer with the default validity window.
    pub fn new(store: Arc<dyn ClaimStore>) -> Self {
        Self {
            store,
            validity: DEFAULT_VALIDITY,
            clock: Arc::new(SystemClock),
        }
    }

    /// Set how long a claim must survive reaping.
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Use a custom time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Try to claim `job_id`.
    ///
    /// Returns `true` to exactly one caller across every replica sharing the
    /// store, `false` to all others (including the winner retrying).
    pub async fn claim(&self, job_id: &str, metadata: serde_json::Value) -> Result<bool> {
        let claimed_at = self.clock.now();
        let claim = JobClaim {
            job_id: job_id.to_string(),
            metadata,
            claimed_at,
            expires_at: saturating_add(claimed_at, self.validity),
        };

        let won = self.store.insert(&claim).await?;
        if won {
            debug!(job_id = %job_id, "Job claimed");
        } else {
            debug!(job_id = %job_id, "Job already claimed elsewhere");
        }
        Ok(won)
    }

    /// Reap claims older than the filter's age whose validity has ended.
    ///
    /// Claims still inside their validity window are never reaped, however
    /// small `older_than` is.
    pub async fn release_expired(&self, filter: ReapFilter) -> Result<u64> {
        let now = self.clock.now();
        let bounds = ExpiryBounds {
            expired_by: now,
            claimed_before: saturating_sub(now, filter.older_than),
        };

        let deleted = self.store.delete_expired(bounds).await?;
        if deleted > 0 {
            info!(deleted, older_than_secs = filter.older_than.as_secs(), "Reaped expired job claims");
        }
        Ok(deleted)
    }
}
