//! In-memory ClaimStore.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{ClaimStore, ExpiryBounds, JobClaim, Result};

/// Claim store backed by a process-local map.
///
/// Shared between simulated replicas in tests by wrapping it in an `Arc`.
#[derive(Default)]
pub struct MemoryClaimStore {
    claims: Mutex<HashMap<String, JobClaim>>,
}

impl MemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored claims.
    pub fn len(&self) -> usize {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a stored claim.
    pub fn get(&self, job_id: &str) -> Option<JobClaim> {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn insert(&self, claim: &JobClaim) -> Result<bool> {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if claims.contains_key(&claim.job_id) {
            return Ok(false);
        }
        claims.insert(claim.job_id.clone(), claim.clone());
        Ok(true)
    }

    async fn delete_expired(&self, bounds: ExpiryBounds) -> Result<u64> {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        let before = claims.len();
        claims.retain(|_, claim| {
            !(claim.expires_at <= bounds.expired_by && claim.claimed_at < bounds.claimed_before)
        });
        Ok((before - claims.len()) as u64)
    }
}
