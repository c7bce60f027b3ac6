use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::contexts;
use crate::jobs::kind::{Exchange, LinkSync, Pull, QueueKind, QueueKindName, RateDelivery};
use crate::jobs::model::{ChannelContext, Failure, HomogeneityKey, Job, NewJob, QueueStats};
use crate::jobs::reason::{self, MAX_REASON_CHARS, SEPARATOR, WATCHDOG_TIMEOUT};
use crate::jobs::store::JobStore;

/// Runnable predicate. Every query that uses it binds `now` as `$1`.
const RUNNABLE: &str = "status IN ('pending', 'retrying') \
     AND retry_count < max_attempts \
     AND locked_at IS NULL \
     AND (run_at IS NULL OR run_at <= $1)";

/// PostgreSQL job table for queue kind `K`.
pub struct PgJobStore<K> {
    pool: PgPool,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for PgJobStore<K> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: QueueKind> PgJobStore<K> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _kind: PhantomData,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &'static str {
        K::TABLE
    }
}

/// Type-erased store for a kind picked at runtime (CLI, admin).
pub fn store_for(kind: QueueKindName, pool: PgPool) -> Arc<dyn JobStore> {
    match kind {
        QueueKindName::Exchange => Arc::new(PgJobStore::<Exchange>::new(pool)),
        QueueKindName::LinkSync => Arc::new(PgJobStore::<LinkSync>::new(pool)),
        QueueKindName::RateDelivery => Arc::new(PgJobStore::<RateDelivery>::new(pool)),
        QueueKindName::Pull => Arc::new(PgJobStore::<Pull>::new(pool)),
    }
}

#[async_trait]
impl<K: QueueKind> JobStore for PgJobStore<K> {
    fn queue(&self) -> &str {
        K::NAME
    }

    // ----------------------------
    // Enqueue / reads
    // ----------------------------

    async fn enqueue(&self, job: NewJob) -> Result<Uuid> {
        let sql = format!(
            r#"
            INSERT INTO {table} (
                id, status, run_at, max_attempts,
                dedupe_key, payload_hash,
                credential_key, endpoint, job_type, priority,
                subject_id, payload_json
            )
            VALUES ($1, 'pending', $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
            table = K::TABLE
        );

        let id: Uuid = sqlx::query_scalar(&sql)
            .bind(Uuid::now_v7())
            .bind(job.run_at)
            .bind(job.max_attempts.unwrap_or(K::DEFAULT_MAX_ATTEMPTS))
            .bind(&job.dedupe_key)
            .bind(&job.payload_hash)
            .bind(&job.credential_key)
            .bind(&job.endpoint)
            .bind(&job.job_type)
            .bind(job.priority)
            .bind(job.subject_id)
            .bind(&job.payload_json)
            .fetch_one(&self.pool)
            .await?;

        Ok(id)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let sql = format!("SELECT * FROM {} WHERE id = $1", K::TABLE);
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    // ----------------------------
    // Watchdog
    // ----------------------------

    async fn reclaim_expired(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        // prior text is cut so the marker always fits in the column budget
        let prior_budget =
            (MAX_REASON_CHARS - WATCHDOG_TIMEOUT.chars().count() - SEPARATOR.chars().count())
                as i32;

        let sql = format!(
            r#"
            UPDATE {table}
            SET status = CASE WHEN retry_count < max_attempts THEN 'retrying' ELSE 'failed' END,
                failed_reason = CASE
                    WHEN failed_reason IS NULL OR failed_reason = '' THEN $3
                    ELSE LEFT(failed_reason, $4) || $5 || $3
                END,
                run_at = $1,
                processing_started_at = NULL,
                locked_at = NULL,
                locked_by = NULL,
                updated_at = $1
            WHERE status = 'processing'
              AND processing_started_at <= $2
            RETURNING id
            "#,
            table = K::TABLE
        );

        let ids: Vec<Uuid> = sqlx::query_scalar(&sql)
            .bind(now)
            .bind(cutoff)
            .bind(WATCHDOG_TIMEOUT)
            .bind(prior_budget)
            .bind(SEPARATOR)
            .fetch_all(&self.pool)
            .await?;

        Ok(ids)
    }

    // ----------------------------
    // Probe-then-homogeneous-batch
    // ----------------------------

    async fn probe_homogeneity_key(&self, now: DateTime<Utc>) -> Result<Option<HomogeneityKey>> {
        let sql = format!(
            r#"
            SELECT credential_key, endpoint
            FROM {table}
            WHERE {RUNNABLE}
            ORDER BY run_at ASC NULLS FIRST, id ASC
            LIMIT 1
            "#,
            table = K::TABLE
        );

        let row = sqlx::query_as::<_, (String, String)>(&sql)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(credential_key, endpoint)| HomogeneityKey::new(credential_key, endpoint)))
    }

    async fn lock_homogeneous_batch(
        &self,
        key: &HomogeneityKey,
        limit: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;

        // 1) locking read; rows held by other claimers are skipped, not waited on
        let select = format!(
            r#"
            SELECT id
            FROM {table}
            WHERE {RUNNABLE}
              AND credential_key = $2
              AND endpoint = $3
            ORDER BY run_at ASC NULLS FIRST, id ASC
            LIMIT $4
            FOR UPDATE SKIP LOCKED
            "#,
            table = K::TABLE
        );

        let ids: Vec<Uuid> = sqlx::query_scalar(&select)
            .bind(now)
            .bind(&key.credential_key)
            .bind(&key.endpoint)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(ids);
        }

        // 2) lease them
        let update = format!(
            r#"
            UPDATE {table}
            SET status = 'processing',
                locked_by = $2,
                locked_at = $1,
                processing_started_at = $1,
                retry_count = retry_count + 1,
                updated_at = $1
            WHERE id = ANY($3)
            "#,
            table = K::TABLE
        );

        sqlx::query(&update)
            .bind(now)
            .bind(worker_id)
            .bind(&ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(ids)
    }

    // ----------------------------
    // Single-row transactional claim
    // ----------------------------

    async fn lock_next(
        &self,
        job_types: &[String],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let select = format!(
            r#"
            SELECT id
            FROM {table}
            WHERE {RUNNABLE}
              AND (cardinality($2::text[]) = 0 OR job_type = ANY($2))
            ORDER BY priority ASC, run_at ASC NULLS FIRST, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
            table = K::TABLE
        );

        let candidate: Option<Uuid> = sqlx::query_scalar(&select)
            .bind(now)
            .bind(job_types)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(id) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let update = format!(
            r#"
            UPDATE {table}
            SET status = 'processing',
                locked_by = $2,
                locked_at = $1,
                processing_started_at = $1,
                retry_count = retry_count + 1,
                updated_at = $1
            WHERE id = $3
            "#,
            table = K::TABLE
        );

        sqlx::query(&update)
            .bind(now)
            .bind(worker_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(id))
    }

    // ----------------------------
    // Candidate-then-conditional-update
    // ----------------------------

    async fn select_candidates(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let sql = format!(
            r#"
            SELECT id
            FROM {table}
            WHERE {RUNNABLE}
            ORDER BY credential_key ASC, endpoint ASC, created_at ASC, id ASC
            LIMIT $2
            "#,
            table = K::TABLE
        );

        let ids: Vec<Uuid> = sqlx::query_scalar(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(ids)
    }

    async fn lock_candidates(
        &self,
        ids: &[Uuid],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // the locked_at guard makes a row another worker took in the meantime a no-op
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'processing',
                locked_by = $2,
                locked_at = $1,
                processing_started_at = $1,
                retry_count = retry_count + 1,
                updated_at = $1
            WHERE id = ANY($3)
              AND locked_at IS NULL
              AND status IN ('pending', 'retrying')
              AND retry_count < max_attempts
            RETURNING id
            "#,
            table = K::TABLE
        );

        let locked: Vec<Uuid> = sqlx::query_scalar(&sql)
            .bind(now)
            .bind(worker_id)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;

        Ok(locked)
    }

    // ----------------------------
    // Hydration reads
    // ----------------------------

    async fn fetch_jobs(&self, ids: &[Uuid]) -> Result<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!("SELECT * FROM {} WHERE id = ANY($1)", K::TABLE);
        let jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn fetch_contexts(&self, keys: &[HomogeneityKey]) -> Result<Vec<ChannelContext>> {
        contexts::fetch_many(&self.pool, keys).await
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    async fn mark_success(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'succeeded',
                run_at = NULL,
                locked_at = NULL,
                locked_by = NULL,
                processing_started_at = NULL,
                failed_reason = NULL,
                dedupe_key = NULL,
                updated_at = $3
            WHERE id = $1
              AND status = 'processing'
              AND locked_by = $2
            "#,
            table = K::TABLE
        );

        let res = sqlx::query(&sql)
            .bind(id)
            .bind(worker_id)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn mark_failure(
        &self,
        id: Uuid,
        worker_id: &str,
        failure: &Failure,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = CASE WHEN retry_count < max_attempts THEN 'retrying' ELSE 'failed' END,
                failed_reason = $3,
                last_http_code = $4,
                run_at = $5,
                locked_at = NULL,
                locked_by = NULL,
                processing_started_at = NULL,
                updated_at = $6
            WHERE id = $1
              AND status = 'processing'
              AND locked_by = $2
            "#,
            table = K::TABLE
        );

        let res = sqlx::query(&sql)
            .bind(id)
            .bind(worker_id)
            .bind(reason::sanitize(&failure.reason))
            .bind(failure.http_code)
            .bind(failure.next_retry_at)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn mark_exhausted(
        &self,
        id: Uuid,
        worker_id: &str,
        failure: &Failure,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'failed',
                max_attempts = retry_count,
                failed_reason = $3,
                last_http_code = $4,
                run_at = NULL,
                locked_at = NULL,
                locked_by = NULL,
                processing_started_at = NULL,
                updated_at = $5
            WHERE id = $1
              AND status = 'processing'
              AND locked_by = $2
            "#,
            table = K::TABLE
        );

        let res = sqlx::query(&sql)
            .bind(id)
            .bind(worker_id)
            .bind(reason::sanitize(&failure.reason))
            .bind(failure.http_code)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(res.rows_affected() == 1)
    }

    // ----------------------------
    // Ops
    // ----------------------------

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'cancelled',
                run_at = NULL,
                updated_at = $2
            WHERE id = $1
              AND status IN ('pending', 'retrying')
            "#,
            table = K::TABLE
        );

        let res = sqlx::query(&sql)
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn grant_attempts(&self, id: Uuid, extra: i32, now: DateTime<Utc>) -> Result<bool> {
        if extra <= 0 {
            return Ok(false);
        }

        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'retrying',
                max_attempts = retry_count + $2,
                run_at = $3,
                updated_at = $3
            WHERE id = $1
              AND (
                status = 'failed'
                OR (status IN ('pending', 'retrying') AND retry_count >= max_attempts)
              )
            "#,
            table = K::TABLE
        );

        let res = sqlx::query(&sql)
            .bind(id)
            .bind(extra)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let by_status_sql = format!(
            "SELECT status, COUNT(*) FROM {} GROUP BY status",
            K::TABLE
        );
        let by_status = sqlx::query_as::<_, (String, i64)>(&by_status_sql)
            .fetch_all(&self.pool)
            .await?;

        let summary_sql = format!(
            r#"
            SELECT
              COUNT(*) FILTER (WHERE {RUNNABLE}) AS runnable,
              COUNT(*) FILTER (
                WHERE retry_count >= max_attempts
                  AND status NOT IN ('succeeded', 'cancelled')
              ) AS exhausted,
              MIN(COALESCE(run_at, created_at)) FILTER (WHERE {RUNNABLE}) AS oldest_runnable_at
            FROM {table}
            "#,
            table = K::TABLE
        );
        let (runnable, exhausted, oldest_runnable_at) =
            sqlx::query_as::<_, (i64, i64, Option<DateTime<Utc>>)>(&summary_sql)
                .bind(now)
                .fetch_one(&self.pool)
                .await?;

        let mut stats = QueueStats {
            queue: K::NAME.to_string(),
            runnable,
            exhausted,
            oldest_runnable_at,
            ..QueueStats::default()
        };
        for (status, count) in by_status {
            stats.record_status(&status, count);
        }

        Ok(stats)
    }
}
