use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::jobs::model::{
    ChannelContext, Failure, HomogeneityKey, Job, JobStatus, NewJob, QueueStats,
    DEFAULT_MAX_ATTEMPTS,
};
use crate::jobs::reason::{self, WATCHDOG_TIMEOUT};
use crate::jobs::store::JobStore;

/// In-process job table with the same transition rules as `PgJobStore`.
///
/// Every operation runs under one mutex, which gives it the atomicity the SQL
/// version gets from a single statement or transaction.
#[derive(Clone)]
pub struct MemoryJobStore {
    name: String,
    default_max_attempts: i32,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    contexts: HashMap<HomogeneityKey, ChannelContext>,
}

impl MemoryJobStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn with_default_max_attempts(mut self, max_attempts: i32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn put_context(&self, context: ChannelContext) -> Result<()> {
        let mut inner = self.lock()?;
        inner.contexts.insert(context.key(), context);
        Ok(())
    }

    /// Snapshot of every row, ordered by id.
    pub fn jobs(&self) -> Result<Vec<Job>> {
        let inner = self.lock()?;
        let mut jobs: Vec<Job> = inner.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| QueueError::Backend(format!("{} store mutex poisoned", self.name)))
    }
}

impl Inner {
    /// Runnable rows sorted by `run_at` (nulls first), then id.
    fn runnable_by_run_at(&self, now: DateTime<Utc>) -> Vec<&Job> {
        let mut rows: Vec<&Job> = self.jobs.values().filter(|j| j.is_runnable(now)).collect();
        rows.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.id.cmp(&b.id)));
        rows
    }

    fn lease(&mut self, id: Uuid, worker_id: &str, now: DateTime<Utc>) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.status = JobStatus::Processing.as_str().to_string();
            job.locked_by = Some(worker_id.to_string());
            job.locked_at = Some(now);
            job.processing_started_at = Some(now);
            job.retry_count += 1;
            job.updated_at = now;
        }
    }

    /// The row, if `worker_id` currently holds its lease.
    fn owned_mut(&mut self, id: Uuid, worker_id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(&id).filter(|j| {
            j.status() == Some(JobStatus::Processing) && j.locked_by.as_deref() == Some(worker_id)
        })
    }
}

fn release(job: &mut Job) {
    job.locked_at = None;
    job.locked_by = None;
    job.processing_started_at = None;
}

fn retry_or_fail(job: &Job) -> &'static str {
    if job.retry_count < job.max_attempts {
        JobStatus::Retrying.as_str()
    } else {
        JobStatus::Failed.as_str()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn queue(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, job: NewJob) -> Result<Uuid> {
        let now = Utc::now();
        let id = Uuid::now_v7();
        let row = Job {
            id,
            status: JobStatus::Pending.as_str().to_string(),
            run_at: job.run_at,
            locked_at: None,
            locked_by: None,
            processing_started_at: None,
            retry_count: 0,
            max_attempts: job.max_attempts.unwrap_or(self.default_max_attempts),
            failed_reason: None,
            last_http_code: None,
            dedupe_key: job.dedupe_key,
            payload_hash: job.payload_hash,
            credential_key: job.credential_key,
            endpoint: job.endpoint,
            job_type: job.job_type,
            priority: job.priority,
            subject_id: job.subject_id,
            payload_json: job.payload_json,
            created_at: now,
            updated_at: now,
        };

        self.lock()?.jobs.insert(id, row);
        Ok(id)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn reclaim_expired(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let mut inner = self.lock()?;
        let mut reclaimed = Vec::new();

        for job in inner.jobs.values_mut() {
            let expired = job.status() == Some(JobStatus::Processing)
                && job.processing_started_at.is_some_and(|at| at <= cutoff);
            if !expired {
                continue;
            }

            job.status = retry_or_fail(job).to_string();
            job.failed_reason = Some(reason::append(
                job.failed_reason.as_deref(),
                WATCHDOG_TIMEOUT,
            ));
            job.run_at = Some(now);
            release(job);
            job.updated_at = now;
            reclaimed.push(job.id);
        }

        reclaimed.sort();
        Ok(reclaimed)
    }

    async fn probe_homogeneity_key(&self, now: DateTime<Utc>) -> Result<Option<HomogeneityKey>> {
        let inner = self.lock()?;
        Ok(inner
            .runnable_by_run_at(now)
            .first()
            .map(|j| j.homogeneity_key()))
    }

    async fn lock_homogeneous_batch(
        &self,
        key: &HomogeneityKey,
        limit: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let mut inner = self.lock()?;

        let ids: Vec<Uuid> = inner
            .runnable_by_run_at(now)
            .into_iter()
            .filter(|j| j.credential_key == key.credential_key && j.endpoint == key.endpoint)
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|j| j.id)
            .collect();

        for id in &ids {
            inner.lease(*id, worker_id, now);
        }
        Ok(ids)
    }

    async fn lock_next(
        &self,
        job_types: &[String],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        let mut inner = self.lock()?;

        let next = inner
            .jobs
            .values()
            .filter(|j| j.is_runnable(now))
            .filter(|j| job_types.is_empty() || job_types.contains(&j.job_type))
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.run_at.cmp(&b.run_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|j| j.id);

        if let Some(id) = next {
            inner.lease(id, worker_id, now);
        }
        Ok(next)
    }

    async fn select_candidates(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let inner = self.lock()?;

        let mut rows: Vec<&Job> = inner.jobs.values().filter(|j| j.is_runnable(now)).collect();
        rows.sort_by(|a, b| {
            a.credential_key
                .cmp(&b.credential_key)
                .then(a.endpoint.cmp(&b.endpoint))
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        Ok(rows
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|j| j.id)
            .collect())
    }

    async fn lock_candidates(
        &self,
        ids: &[Uuid],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let mut inner = self.lock()?;
        let mut locked = Vec::new();

        for id in ids {
            // same guard as the SQL update: unlocked, waiting, attempts left
            let takeable = inner.jobs.get(id).is_some_and(|j| {
                j.locked_at.is_none()
                    && matches!(j.status(), Some(JobStatus::Pending | JobStatus::Retrying))
                    && j.retry_count < j.max_attempts
            });
            if takeable && !locked.contains(id) {
                inner.lease(*id, worker_id, now);
                locked.push(*id);
            }
        }
        Ok(locked)
    }

    async fn fetch_jobs(&self, ids: &[Uuid]) -> Result<Vec<Job>> {
        let inner = self.lock()?;
        Ok(ids.iter().filter_map(|id| inner.jobs.get(id).cloned()).collect())
    }

    async fn fetch_contexts(&self, keys: &[HomogeneityKey]) -> Result<Vec<ChannelContext>> {
        let inner = self.lock()?;
        Ok(keys
            .iter()
            .filter_map(|k| inner.contexts.get(k).cloned())
            .collect())
    }

    async fn mark_success(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock()?;
        let Some(job) = inner.owned_mut(id, worker_id) else {
            return Ok(false);
        };

        job.status = JobStatus::Succeeded.as_str().to_string();
        job.run_at = None;
        release(job);
        job.failed_reason = None;
        job.dedupe_key = None;
        job.updated_at = now;
        Ok(true)
    }

    async fn mark_failure(
        &self,
        id: Uuid,
        worker_id: &str,
        failure: &Failure,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        let Some(job) = inner.owned_mut(id, worker_id) else {
            return Ok(false);
        };

        job.status = retry_or_fail(job).to_string();
        job.failed_reason = Some(reason::sanitize(&failure.reason));
        job.last_http_code = failure.http_code;
        job.run_at = failure.next_retry_at;
        release(job);
        job.updated_at = now;
        Ok(true)
    }

    async fn mark_exhausted(
        &self,
        id: Uuid,
        worker_id: &str,
        failure: &Failure,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        let Some(job) = inner.owned_mut(id, worker_id) else {
            return Ok(false);
        };

        job.status = JobStatus::Failed.as_str().to_string();
        job.max_attempts = job.retry_count;
        job.failed_reason = Some(reason::sanitize(&failure.reason));
        job.last_http_code = failure.http_code;
        job.run_at = None;
        release(job);
        job.updated_at = now;
        Ok(true)
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock()?;
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !matches!(job.status(), Some(JobStatus::Pending | JobStatus::Retrying)) {
            return Ok(false);
        }

        job.status = JobStatus::Cancelled.as_str().to_string();
        job.run_at = None;
        job.updated_at = now;
        Ok(true)
    }

    async fn grant_attempts(&self, id: Uuid, extra: i32, now: DateTime<Utc>) -> Result<bool> {
        if extra <= 0 {
            return Ok(false);
        }

        let mut inner = self.lock()?;
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };

        let revivable = match job.status() {
            Some(JobStatus::Failed) => true,
            Some(JobStatus::Pending | JobStatus::Retrying) => job.is_exhausted(),
            _ => false,
        };
        if !revivable {
            return Ok(false);
        }

        job.status = JobStatus::Retrying.as_str().to_string();
        job.max_attempts = job.retry_count.saturating_add(extra);
        job.run_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let inner = self.lock()?;
        let mut stats = QueueStats {
            queue: self.name.clone(),
            ..QueueStats::default()
        };

        for job in inner.jobs.values() {
            stats.record_status(&job.status, 1);

            let settled = matches!(
                job.status(),
                Some(JobStatus::Succeeded | JobStatus::Cancelled)
            );
            if job.is_exhausted() && !settled {
                stats.exhausted += 1;
            }

            if job.is_runnable(now) {
                stats.runnable += 1;
                let ready_since = job.run_at.unwrap_or(job.created_at);
                stats.oldest_runnable_at = Some(match stats.oldest_runnable_at {
                    Some(oldest) => oldest.min(ready_since),
                    None => ready_since,
                });
            }
        }

        Ok(stats)
    }
}
