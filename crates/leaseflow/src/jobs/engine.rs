use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::{rngs::StdRng, SeedableRng};
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::claim::ClaimStrategy;
use crate::jobs::hydrate::{HydratedJob, Hydrator};
use crate::jobs::kind::{QueueKind, DEFAULT_LEASE_TTL_SECS};
use crate::jobs::model::{Failure, Job};
use crate::jobs::pg::PgJobStore;
use crate::jobs::retry::{classify_http, ErrorClass, RetryPolicy};
use crate::jobs::store::JobStore;
use crate::jobs::watchdog::Watchdog;

/// Per-queue-kind knobs.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub lease_ttl: Duration,
    pub retry: RetryPolicy,
    /// Type filter for single-row queues; empty means all types.
    pub job_types: Vec<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::seconds(DEFAULT_LEASE_TTL_SECS),
            retry: RetryPolicy::default(),
            job_types: Vec::new(),
        }
    }
}

impl QueueSettings {
    pub fn for_kind<K: QueueKind>() -> Self {
        Self {
            lease_ttl: Duration::seconds(K::DEFAULT_LEASE_TTL_SECS),
            ..Self::default()
        }
    }
}

/// Claim/complete orchestration for one queue kind.
///
/// `claim` = watchdog pass, strategy lock, hydration by the locked id list.
/// Dispatchers report every claimed job back exactly once through
/// `mark_success`, `mark_failure` or `report_failure`.
pub struct QueueEngine<S> {
    store: S,
    strategy: Arc<dyn ClaimStrategy>,
    watchdog: Watchdog,
    hydrator: Hydrator,
    retry: RetryPolicy,
}

impl<S: Clone> Clone for QueueEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            strategy: Arc::clone(&self.strategy),
            watchdog: self.watchdog,
            hydrator: self.hydrator,
            retry: self.retry.clone(),
        }
    }
}

impl<K: QueueKind> QueueEngine<PgJobStore<K>> {
    /// Typed repository for kind `K`, using the kind's claim strategy.
    pub fn for_kind(pool: PgPool, settings: &QueueSettings) -> Self {
        Self::new(PgJobStore::<K>::new(pool), K::strategy(settings), settings)
    }
}

impl<S: JobStore> QueueEngine<S> {
    pub fn new(store: S, strategy: Arc<dyn ClaimStrategy>, settings: &QueueSettings) -> Self {
        Self {
            store,
            strategy,
            watchdog: Watchdog::new(settings.lease_ttl),
            hydrator: Hydrator,
            retry: settings.retry.clone(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn run_watchdog(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.watchdog.run(&self.store, now).await
    }

    pub async fn claim(
        &self,
        limit: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<HydratedJob>> {
        // 1) recover crashed leases first so they are claimable in this pass
        self.watchdog.run(&self.store, now).await?;

        // 2) lock
        let ids = self
            .strategy
            .claim_ids(&self.store, limit, worker_id, now)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // 3) hydrate by exactly those ids
        let jobs = self.hydrator.hydrate(&self.store, &ids).await?;

        debug!(
            queue = self.store.queue(),
            strategy = self.strategy.name(),
            worker_id,
            claimed = jobs.len(),
            "claimed jobs"
        );
        Ok(jobs)
    }

    pub async fn mark_success(&self, job: &Job, now: DateTime<Utc>) -> Result<bool> {
        let Some(owner) = job.locked_by.as_deref() else {
            warn!(queue = self.store.queue(), job_id = %job.id, "mark_success on a job without a lease");
            return Ok(false);
        };

        let applied = self.store.mark_success(job.id, owner, now).await?;
        if !applied {
            warn!(
                queue = self.store.queue(),
                job_id = %job.id,
                worker_id = owner,
                "lease lost before success was recorded"
            );
        }
        Ok(applied)
    }

    /// Record a failed attempt. `retry_count` is not touched here: it was
    /// already bumped when the job was claimed.
    pub async fn mark_failure(
        &self,
        job: &Job,
        reason: &str,
        http_code: Option<i32>,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let failure = Failure {
            reason: reason.to_string(),
            http_code,
            next_retry_at,
        };
        self.apply_failure(job, &failure, false, now).await
    }

    /// Failure reporting driven by the retry policy: retryable codes are
    /// re-queued with exponential backoff, non-retryable ones end the job.
    pub async fn report_failure(
        &self,
        job: &Job,
        reason: &str,
        http_code: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match classify_http(http_code) {
            ErrorClass::NonRetryable => {
                let failure = Failure {
                    reason: reason.to_string(),
                    http_code,
                    next_retry_at: None,
                };
                self.apply_failure(job, &failure, true, now).await
            }
            ErrorClass::Retryable => {
                let next_retry_at = {
                    let mut rng = StdRng::from_entropy();
                    self.retry.next_retry_at(job.retry_count, now, &mut rng)
                };
                self.mark_failure(job, reason, http_code, Some(next_retry_at), now)
                    .await
            }
        }
    }

    async fn apply_failure(
        &self,
        job: &Job,
        failure: &Failure,
        give_up: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(owner) = job.locked_by.as_deref() else {
            warn!(queue = self.store.queue(), job_id = %job.id, "failure reported for a job without a lease");
            return Ok(false);
        };

        let applied = if give_up {
            self.store.mark_exhausted(job.id, owner, failure, now).await?
        } else {
            self.store.mark_failure(job.id, owner, failure, now).await?
        };

        if applied {
            info!(
                queue = self.store.queue(),
                job_id = %job.id,
                worker_id = owner,
                retry_count = job.retry_count,
                max_attempts = job.max_attempts,
                http_code = failure.http_code,
                terminal = give_up || RetryPolicy::is_exhausted(job.retry_count, job.max_attempts),
                "job attempt failed"
            );
        } else {
            warn!(
                queue = self.store.queue(),
                job_id = %job.id,
                worker_id = owner,
                "lease lost before failure was recorded"
            );
        }
        Ok(applied)
    }
}
