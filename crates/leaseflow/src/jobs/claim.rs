//! Claim strategies.
//!
//! All three share one contract: never hand out a job still leased to another
//! worker, and never let two concurrent claims return overlapping ids. They
//! differ in how the storage layer provides that guarantee and in batch shape.
//! The watchdog pass and hydration are done by the engine around these calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::store::JobStore;

#[async_trait]
pub trait ClaimStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lock runnable jobs for `worker_id` and return their ids in claim order.
    async fn claim_ids(
        &self,
        store: &dyn JobStore,
        limit: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>>;
}

/// Probe for one homogeneity key, then lock a batch that shares it.
///
/// Used where the dispatcher reuses one credential/endpoint connection per
/// batch. If the probe finds nothing the batch is empty; there is no fallback
/// to a mixed batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeBatchClaim;

#[async_trait]
impl ClaimStrategy for ProbeBatchClaim {
    fn name(&self) -> &'static str {
        "probe_batch"
    }

    async fn claim_ids(
        &self,
        store: &dyn JobStore,
        limit: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        // 1) probe (plain read)
        let Some(key) = store.probe_homogeneity_key(now).await? else {
            return Ok(Vec::new());
        };

        // 2) locking select + lease update for that key only
        let ids = store
            .lock_homogeneous_batch(&key, limit, worker_id, now)
            .await?;

        debug!(
            queue = store.queue(),
            worker_id,
            key = %key,
            claimed = ids.len(),
            "probe batch claimed"
        );
        Ok(ids)
    }
}

/// One job per call, inside a single transaction, highest priority first.
#[derive(Debug, Clone, Default)]
pub struct SingleRowClaim {
    job_types: Vec<String>,
}

impl SingleRowClaim {
    /// `job_types` empty means every type is eligible.
    pub fn new(job_types: Vec<String>) -> Self {
        Self { job_types }
    }

    pub fn job_types(&self) -> &[String] {
        &self.job_types
    }
}

#[async_trait]
impl ClaimStrategy for SingleRowClaim {
    fn name(&self) -> &'static str {
        "single_row"
    }

    async fn claim_ids(
        &self,
        store: &dyn JobStore,
        limit: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let claimed = store.lock_next(&self.job_types, worker_id, now).await?;
        Ok(claimed.into_iter().collect())
    }
}

/// Plain candidate read followed by an update guarded on `locked_at IS NULL`.
///
/// A candidate taken by another worker between the two steps is a no-op in
/// the update and silently drops out. The returned ids are exactly the rows
/// the guarded update touched; callers hydrate by that list and never by
/// "rows currently locked by me".
#[derive(Debug, Clone, Copy, Default)]
pub struct CandidateClaim;

#[async_trait]
impl ClaimStrategy for CandidateClaim {
    fn name(&self) -> &'static str {
        "candidate"
    }

    async fn claim_ids(
        &self,
        store: &dyn JobStore,
        limit: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        // 1) candidates (no lock)
        let candidates = store.select_candidates(limit, now).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // 2) guarded update; losers fall out here
        let locked = store.lock_candidates(&candidates, worker_id, now).await?;

        if locked.len() < candidates.len() {
            debug!(
                queue = store.queue(),
                worker_id,
                candidates = candidates.len(),
                locked = locked.len(),
                "lost some candidates to other workers"
            );
        }

        // keep candidate order
        Ok(candidates
            .into_iter()
            .filter(|id| locked.contains(id))
            .collect())
    }
}
