//! SQLite ClaimStore implementation.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sea_query::{Expr, Query, SqliteQueryBuilder};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::schema::{JobClaims, CREATE_JOB_CLAIMS_EXPIRY_INDEX, CREATE_JOB_CLAIMS_TABLE};
use super::{ClaimStore, ExpiryBounds, JobClaim, Result};

/// SQLite implementation of ClaimStore.
///
/// The primary key on `job_id` is the uniqueness constraint every replica
/// races against.
pub struct SqliteClaimStore {
    pool: SqlitePool,
}

impl SqliteClaimStore {
    /// Create a store over an existing pool. Call `init` before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) a database file and initialize the schema.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| super::ReducerError::Unavailable(e.to_string()))?;
            }
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        let store = Self::new(pool);
        store.init().await?;
        info!(path = %path.display(), "SQLite claim store ready");
        Ok(store)
    }

    /// Single-connection in-memory database with the schema initialized.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    /// Create the claims table and index if they do not exist.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_JOB_CLAIMS_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_JOB_CLAIMS_EXPIRY_INDEX)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClaimStore for SqliteClaimStore {
    async fn insert(&self, claim: &JobClaim) -> Result<bool> {
        let metadata = serde_json::to_string(&claim.metadata)?;

        let query = Query::insert()
            .into_table(JobClaims::Table)
            .columns([
                JobClaims::JobId,
                JobClaims::Metadata,
                JobClaims::ClaimedAt,
                JobClaims::ExpiresAt,
            ])
            .values_panic([
                claim.job_id.clone().into(),
                metadata.into(),
                claim.claimed_at.timestamp_millis().into(),
                claim.expires_at.timestamp_millis().into(),
            ])
            .to_string(SqliteQueryBuilder);

        match sqlx::query(&query).execute(&self.pool).await {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_expired(&self, bounds: ExpiryBounds) -> Result<u64> {
        let query = Query::delete()
            .from_table(JobClaims::Table)
            .and_where(Expr::col(JobClaims::ExpiresAt).lte(bounds.expired_by.timestamp_millis()))
            .and_where(Expr::col(JobClaims::ClaimedAt).lt(bounds.claimed_before.timestamp_millis()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
