mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{job, memory_engine};
use leaseflow::jobs::reason::{MAX_REASON_CHARS, UNSPECIFIED_FAILURE, WATCHDOG_TIMEOUT};
use leaseflow::jobs::{
    CandidateClaim, HydratedJob, JobStatus, JobStore, MemoryJobStore, ProbeBatchClaim,
    QueueEngine, SingleRowClaim,
};

fn single_row() -> QueueEngine<MemoryJobStore> {
    memory_engine(Arc::new(SingleRowClaim::default()))
}

async fn claim_one(
    engine: &QueueEngine<MemoryJobStore>,
    worker_id: &str,
    now: chrono::DateTime<Utc>,
) -> Option<HydratedJob> {
    let mut batch = engine.claim(10, worker_id, now).await.unwrap();
    assert!(batch.len() <= 1);
    batch.pop()
}

#[tokio::test]
async fn expired_lease_is_reclaimed_no_earlier_than_ttl() {
    let engine = single_row();
    let id = engine.store().enqueue(job("acct", "feed")).await.unwrap();

    let t0 = Utc::now();
    claim_one(&engine, "w1", t0).await.unwrap();

    // one second short of the TTL: still leased, nothing to claim
    assert!(claim_one(&engine, "w2", t0 + Duration::seconds(89)).await.is_none());
    let row = engine.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(row.status(), Some(JobStatus::Processing));

    let at_ttl = t0 + Duration::seconds(90);
    assert_eq!(engine.run_watchdog(at_ttl).await.unwrap(), vec![id]);

    let row = engine.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(row.status(), Some(JobStatus::Retrying));
    assert_eq!(row.retry_count, 1, "watchdog must not count an attempt");
    assert_eq!(row.failed_reason.as_deref(), Some(WATCHDOG_TIMEOUT));
    assert_eq!(row.run_at, Some(at_ttl));
    assert!(row.locked_by.is_none() && row.locked_at.is_none());
    assert!(row.processing_started_at.is_none());

    let again = claim_one(&engine, "w2", at_ttl).await.unwrap();
    assert_eq!(again.job.retry_count, 2);
}

#[tokio::test]
async fn watchdog_appends_to_earlier_reason() {
    let engine = single_row();
    let id = engine.store().enqueue(job("acct", "feed")).await.unwrap();

    let t0 = Utc::now();
    let first = claim_one(&engine, "w1", t0).await.unwrap();
    assert!(engine
        .mark_failure(&first.job, "http 503", Some(503), None, t0)
        .await
        .unwrap());

    claim_one(&engine, "w1", t0).await.unwrap();
    engine.run_watchdog(t0 + Duration::seconds(90)).await.unwrap();

    let row = engine.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(row.failed_reason.as_deref(), Some("http 503 | watchdog_timeout"));
    assert_eq!(row.last_http_code, Some(503));
}

#[tokio::test]
async fn watchdog_on_last_attempt_fails_the_job() {
    let engine = single_row();
    let id = engine
        .store()
        .enqueue(job("acct", "feed").max_attempts(1))
        .await
        .unwrap();

    let t0 = Utc::now();
    claim_one(&engine, "w1", t0).await.unwrap();
    engine.run_watchdog(t0 + Duration::seconds(120)).await.unwrap();

    let row = engine.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(row.status(), Some(JobStatus::Failed));
    assert!(claim_one(&engine, "w1", t0 + Duration::days(1)).await.is_none());
}

#[tokio::test]
async fn three_failures_exhaust_three_attempts() {
    let engine = memory_engine(Arc::new(CandidateClaim));
    let id = engine
        .store()
        .enqueue(job("acct", "links").max_attempts(3))
        .await
        .unwrap();

    let now = Utc::now();
    for attempt in 1..=3 {
        let claimed = claim_one(&engine, "w1", now).await.unwrap();
        assert_eq!(claimed.job.retry_count, attempt);
        assert!(engine
            .mark_failure(&claimed.job, "channel rejected", Some(502), None, now)
            .await
            .unwrap());
    }

    assert!(claim_one(&engine, "w1", now).await.is_none());
    assert!(claim_one(&engine, "w1", now + Duration::days(30)).await.is_none());

    let row = engine.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(row.retry_count, 3);
    assert_eq!(row.status(), Some(JobStatus::Failed));
    assert!(row.is_exhausted());
}

#[tokio::test]
async fn oversized_reason_is_truncated_not_rejected() {
    let engine = single_row();
    let id = engine.store().enqueue(job("acct", "feed")).await.unwrap();
    let now = Utc::now();

    let claimed = claim_one(&engine, "w1", now).await.unwrap();
    let huge = "x".repeat(70_000);
    assert!(engine
        .mark_failure(&claimed.job, &huge, None, None, now)
        .await
        .unwrap());

    let row = engine.store().get_job(id).await.unwrap().unwrap();
    let reason = row.failed_reason.as_ref().unwrap();
    assert_eq!(reason.chars().count(), MAX_REASON_CHARS);
    assert_eq!(row.status(), Some(JobStatus::Retrying));
}

#[tokio::test]
async fn empty_reason_gets_a_placeholder() {
    let engine = single_row();
    let id = engine.store().enqueue(job("acct", "feed")).await.unwrap();
    let now = Utc::now();

    let claimed = claim_one(&engine, "w1", now).await.unwrap();
    engine
        .mark_failure(&claimed.job, "", None, None, now)
        .await
        .unwrap();

    let row = engine.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(row.failed_reason.as_deref(), Some(UNSPECIFIED_FAILURE));
}

#[tokio::test]
async fn stale_owner_cannot_complete_reclaimed_job() {
    let engine = single_row();
    let id = engine.store().enqueue(job("acct", "feed")).await.unwrap();

    let t0 = Utc::now();
    let stale = claim_one(&engine, "w1", t0).await.unwrap();

    let t1 = t0 + Duration::seconds(90);
    let fresh = claim_one(&engine, "w2", t1).await.unwrap();
    assert_eq!(fresh.job.id, id);

    assert!(!engine.mark_success(&stale.job, t1).await.unwrap());
    assert!(!engine
        .mark_failure(&stale.job, "late", None, None, t1)
        .await
        .unwrap());

    let row = engine.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(row.locked_by.as_deref(), Some("w2"));

    assert!(engine.mark_success(&fresh.job, t1).await.unwrap());
    let row = engine.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(row.status(), Some(JobStatus::Succeeded));
}

#[tokio::test]
async fn success_clears_lease_and_dedupe_key() {
    let engine = memory_engine(Arc::new(ProbeBatchClaim));
    let id = engine
        .store()
        .enqueue(
            job("acct", "rates")
                .dedupe_key("rate:acct:2026-10")
                .payload_hash("abc123"),
        )
        .await
        .unwrap();
    let now = Utc::now();

    let claimed = claim_one(&engine, "w1", now).await.unwrap();
    assert!(engine.mark_success(&claimed.job, now).await.unwrap());

    let row = engine.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(row.status(), Some(JobStatus::Succeeded));
    assert!(row.dedupe_key.is_none());
    assert_eq!(row.payload_hash.as_deref(), Some("abc123"));
    assert!(row.locked_at.is_none() && row.locked_by.is_none());
    assert!(row.run_at.is_none());
    assert!(claim_one(&engine, "w1", now).await.is_none());
}

#[tokio::test]
async fn retryable_failure_backs_off() {
    let engine = single_row();
    let id = engine.store().enqueue(job("acct", "feed")).await.unwrap();
    let now = Utc::now();

    let claimed = claim_one(&engine, "w1", now).await.unwrap();
    assert!(engine
        .report_failure(&claimed.job, "throttled", Some(429), now)
        .await
        .unwrap());

    let row = engine.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(row.status(), Some(JobStatus::Retrying));
    let run_at = row.run_at.unwrap();
    assert!(run_at > now && run_at <= now + Duration::seconds(3));

    assert!(claim_one(&engine, "w1", now).await.is_none());
    assert!(claim_one(&engine, "w1", now + Duration::seconds(5)).await.is_some());
}

#[tokio::test]
async fn non_retryable_failure_is_terminal_until_granted() {
    let engine = single_row();
    let id = engine.store().enqueue(job("acct", "feed")).await.unwrap();
    let now = Utc::now();

    let claimed = claim_one(&engine, "w1", now).await.unwrap();
    assert!(engine
        .report_failure(&claimed.job, "unknown property", Some(404), now)
        .await
        .unwrap());

    let row = engine.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(row.status(), Some(JobStatus::Failed));
    assert_eq!(row.max_attempts, 1);
    assert_eq!(row.last_http_code, Some(404));
    assert!(claim_one(&engine, "w1", now).await.is_none());

    assert!(engine.store().grant_attempts(id, 2, now).await.unwrap());
    let row = engine.store().get_job(id).await.unwrap().unwrap();
    assert_eq!(row.status(), Some(JobStatus::Retrying));
    assert_eq!(row.max_attempts, 3);
    assert_eq!(row.retry_count, 1);

    let again = claim_one(&engine, "w1", now).await.unwrap();
    assert_eq!(again.job.retry_count, 2);
}

#[tokio::test]
async fn cancel_only_touches_waiting_jobs() {
    let engine = single_row();
    let waiting = engine.store().enqueue(job("acct", "feed")).await.unwrap();
    let now = Utc::now();

    assert!(engine.store().cancel(waiting, now).await.unwrap());
    assert!(!engine.store().cancel(waiting, now).await.unwrap());
    assert!(claim_one(&engine, "w1", now).await.is_none());

    let leased = engine.store().enqueue(job("acct", "feed")).await.unwrap();
    claim_one(&engine, "w1", now).await.unwrap();
    assert!(!engine.store().cancel(leased, now).await.unwrap());
    assert!(!engine.store().grant_attempts(leased, 1, now).await.unwrap());

    let stats = engine.store().stats(now).await.unwrap();
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.runnable, 0);
}
