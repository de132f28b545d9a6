//! Database schema definitions using sea-query.

use sea_query::Iden;

/// Job claims table schema.
#[derive(Iden)]
pub enum JobClaims {
    Table,
    #[iden = "job_id"]
    JobId,
    #[iden = "metadata"]
    Metadata,
    #[iden = "claimed_at"]
    ClaimedAt,
    #[iden = "expires_at"]
    ExpiresAt,
}

/// SQL for creating the job claims table.
///
/// Timestamps are milliseconds since the Unix epoch so range predicates
/// compare numerically.
pub const CREATE_JOB_CLAIMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_claims (
    job_id TEXT NOT NULL PRIMARY KEY,
    metadata TEXT NOT NULL,
    claimed_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
)
"#;

/// SQL for the reaper's lookup index.
pub const CREATE_JOB_CLAIMS_EXPIRY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_job_claims_expires_at ON job_claims(expires_at)";
