use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::model::{ChannelContext, Failure, HomogeneityKey, Job, NewJob, QueueStats};

/// Storage primitives for one queue kind.
///
/// Every method that changes a row is one of the four mutation patterns the
/// engine allows: claim, success, failure, watchdog (plus the ops-only
/// `cancel` and `grant_attempts`, which never touch a leased row).
///
/// "Runnable" always means: status `pending` or `retrying`, `retry_count <
/// max_attempts`, unlocked, and `run_at` null or not after `now`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Queue kind name, used in logs and stats.
    fn queue(&self) -> &str;

    async fn enqueue(&self, job: NewJob) -> Result<Uuid>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    // ----------------------------
    // Watchdog
    // ----------------------------

    /// Return every `processing` row whose `processing_started_at <= cutoff`
    /// to a retryable state. Returns the reclaimed ids.
    async fn reclaim_expired(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>)
        -> Result<Vec<Uuid>>;

    // ----------------------------
    // Probe-then-homogeneous-batch
    // ----------------------------

    /// Plain read: homogeneity key of the oldest runnable row.
    async fn probe_homogeneity_key(&self, now: DateTime<Utc>) -> Result<Option<HomogeneityKey>>;

    /// Lock up to `limit` runnable rows sharing `key`, skipping rows another
    /// transaction holds. Returns ids in claim order (`run_at`, then `id`).
    async fn lock_homogeneous_batch(
        &self,
        key: &HomogeneityKey,
        limit: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>>;

    // ----------------------------
    // Single-row transactional claim
    // ----------------------------

    /// Lock the single best runnable row (`priority`, `run_at`, `id`).
    /// An empty `job_types` slice means any type.
    async fn lock_next(
        &self,
        job_types: &[String],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>>;

    // ----------------------------
    // Candidate-then-conditional-update
    // ----------------------------

    /// Plain, non-locking read of runnable ids ordered for batching fairness.
    async fn select_candidates(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Guarded update: only rows that are still unlocked and runnable-by-status
    /// are taken. Returns the subset actually locked for `worker_id`.
    async fn lock_candidates(
        &self,
        ids: &[Uuid],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>>;

    // ----------------------------
    // Hydration reads
    // ----------------------------

    async fn fetch_jobs(&self, ids: &[Uuid]) -> Result<Vec<Job>>;

    async fn fetch_contexts(&self, keys: &[HomogeneityKey]) -> Result<Vec<ChannelContext>>;

    // ----------------------------
    // State transitions (lease owner only)
    // ----------------------------

    /// `false` when `worker_id` no longer holds the lease.
    async fn mark_success(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Re-queue as `retrying` (or `failed` once attempts are used up).
    async fn mark_failure(
        &self,
        id: Uuid,
        worker_id: &str,
        failure: &Failure,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Non-retryable failure: `failed`, with `max_attempts` pinned to `retry_count`.
    async fn mark_exhausted(
        &self,
        id: Uuid,
        worker_id: &str,
        failure: &Failure,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    // ----------------------------
    // Ops
    // ----------------------------

    /// Cancel a job that is waiting (`pending` or `retrying`). Leased jobs
    /// cannot be cancelled.
    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Revive a terminal `failed` job by raising its ceiling to
    /// `retry_count + extra`. `retry_count` is left untouched.
    async fn grant_attempts(&self, id: Uuid, extra: i32, now: DateTime<Utc>) -> Result<bool>;

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats>;
}
