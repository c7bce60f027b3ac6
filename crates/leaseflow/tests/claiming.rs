mod common;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use common::{context, job, memory_engine};
use leaseflow::jobs::{
    CandidateClaim, ClaimStrategy, Hydrator, JobStatus, JobStore, ProbeBatchClaim,
    SingleRowClaim,
};
use uuid::Uuid;

async fn drain_in_parallel(strategy: Arc<dyn ClaimStrategy>, workers: usize, limit: i64) {
    let engine = memory_engine(strategy);
    let mut expected = HashSet::new();
    for i in 0..40 {
        let cred = format!("acct-{}", i % 3);
        expected.insert(engine.store().enqueue(job(&cred, "bookings")).await.unwrap());
    }

    let now = Utc::now();
    let mut handles = Vec::new();
    for w in 0..workers {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("worker-{w}");
            let mut mine = Vec::new();
            loop {
                let batch = engine.claim(limit, &worker_id, now).await.unwrap();
                if batch.is_empty() {
                    // a lost race also yields an empty batch; stop only when nothing is left
                    if engine.store().stats(now).await.unwrap().runnable == 0 {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                }
                for h in batch {
                    assert_eq!(h.job.locked_by.as_deref(), Some(worker_id.as_str()));
                    mine.push(h.job.id);
                }
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(seen, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_claim_claimers_never_share_a_job() {
    drain_in_parallel(Arc::new(ProbeBatchClaim), 8, 5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_row_claimers_never_share_a_job() {
    drain_in_parallel(Arc::new(SingleRowClaim::default()), 8, 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn candidate_claimers_never_share_a_job() {
    drain_in_parallel(Arc::new(CandidateClaim), 8, 7).await;
}

#[tokio::test]
async fn batch_claim_never_mixes_contexts() {
    let engine = memory_engine(Arc::new(ProbeBatchClaim));
    let j2 = engine.store().enqueue(job("acct-a", "bookings")).await.unwrap();
    let j3 = engine.store().enqueue(job("acct-b", "bookings")).await.unwrap();

    let now = Utc::now();
    let first: Vec<Uuid> = engine
        .claim(10, "w1", now)
        .await
        .unwrap()
        .into_iter()
        .map(|h| h.job.id)
        .collect();
    assert_eq!(first.len(), 1);
    assert!(first[0] == j2 || first[0] == j3);

    // the other one comes out on the next call
    let second: Vec<Uuid> = engine
        .claim(10, "w1", now)
        .await
        .unwrap()
        .into_iter()
        .map(|h| h.job.id)
        .collect();
    assert_eq!(second.len(), 1);
    assert_ne!(first[0], second[0]);
}

#[tokio::test]
async fn batch_claim_shares_key_and_endpoint() {
    let engine = memory_engine(Arc::new(ProbeBatchClaim));
    for _ in 0..3 {
        engine.store().enqueue(job("acct-a", "rates")).await.unwrap();
        engine.store().enqueue(job("acct-a", "bookings")).await.unwrap();
    }

    let now = Utc::now();
    loop {
        let batch = engine.claim(10, "w1", now).await.unwrap();
        if batch.is_empty() {
            break;
        }
        assert_eq!(batch.len(), 3);
        let keys: HashSet<_> = batch.iter().map(|h| h.job.homogeneity_key()).collect();
        assert_eq!(keys.len(), 1);
    }
}

#[tokio::test]
async fn batch_claim_respects_limit() {
    let engine = memory_engine(Arc::new(ProbeBatchClaim));
    for _ in 0..5 {
        engine.store().enqueue(job("acct-a", "rates")).await.unwrap();
    }

    let batch = engine.claim(2, "w1", Utc::now()).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert!(engine.claim(0, "w1", Utc::now()).await.unwrap().is_empty());
}

#[tokio::test]
async fn claim_hydrates_channel_context() {
    let engine = memory_engine(Arc::new(ProbeBatchClaim));
    engine.store().put_context(context("acct-a", "rates")).unwrap();
    engine.store().enqueue(job("acct-a", "rates")).await.unwrap();

    let batch = engine.claim(10, "w1", Utc::now()).await.unwrap();
    assert_eq!(batch.len(), 1);
    let ctx = batch[0].context.as_ref().expect("context attached");
    assert_eq!(ctx.base_url, "https://acct-a.channel.test");
    assert_eq!(batch[0].job.status(), Some(JobStatus::Processing));
    assert_eq!(batch[0].job.retry_count, 1);
}

#[tokio::test]
async fn single_row_takes_lowest_priority_value_first() {
    let engine = memory_engine(Arc::new(SingleRowClaim::default()));
    let low = engine
        .store()
        .enqueue(job("acct", "feed").priority(5))
        .await
        .unwrap();
    let high = engine
        .store()
        .enqueue(job("acct", "feed").priority(1))
        .await
        .unwrap();

    let now = Utc::now();
    let first = engine.claim(10, "w1", now).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].job.id, high);

    let second = engine.claim(10, "w1", now).await.unwrap();
    assert_eq!(second[0].job.id, low);
}

#[tokio::test]
async fn single_row_filters_by_job_type() {
    let engine = memory_engine(Arc::new(SingleRowClaim::new(vec!["ical".to_string()])));
    engine
        .store()
        .enqueue(job("acct", "feed").job_type("api"))
        .await
        .unwrap();
    let ical = engine
        .store()
        .enqueue(job("acct", "feed").job_type("ical"))
        .await
        .unwrap();

    let now = Utc::now();
    let batch = engine.claim(10, "w1", now).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].job.id, ical);
    assert!(engine.claim(10, "w1", now).await.unwrap().is_empty());
}

#[tokio::test]
async fn candidate_lost_to_another_worker_drops_out() {
    let engine = memory_engine(Arc::new(CandidateClaim));
    let store = engine.store();
    for _ in 0..3 {
        store.enqueue(job("acct", "links")).await.unwrap();
    }

    let now = Utc::now();
    let candidates = store.select_candidates(10, now).await.unwrap();
    assert_eq!(candidates.len(), 3);

    // another worker wins the middle row between read and update
    let stolen = store
        .lock_candidates(&candidates[1..2], "w2", now)
        .await
        .unwrap();
    assert_eq!(stolen, vec![candidates[1]]);

    let mine = store.lock_candidates(&candidates, "w1", now).await.unwrap();
    assert_eq!(mine, vec![candidates[0], candidates[2]]);

    // hydration by the returned list never picks up the stolen row
    let hydrated = Hydrator.hydrate(store, &mine).await.unwrap();
    assert!(hydrated
        .iter()
        .all(|h| h.job.locked_by.as_deref() == Some("w1")));

    let stolen_row = store.get_job(candidates[1]).await.unwrap().unwrap();
    assert_eq!(stolen_row.locked_by.as_deref(), Some("w2"));
    assert_eq!(stolen_row.retry_count, 1);
}

#[tokio::test]
async fn future_jobs_wait_for_run_at() {
    let engine = memory_engine(Arc::new(CandidateClaim));
    let now = Utc::now();
    engine
        .store()
        .enqueue(job("acct", "links").run_at(now + chrono::Duration::minutes(5)))
        .await
        .unwrap();

    assert!(engine.claim(10, "w1", now).await.unwrap().is_empty());
    let later = engine
        .claim(10, "w1", now + chrono::Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(later.len(), 1);
}

/// Enqueues a mix of null, past and tied `run_at` values out of order and
/// returns the ids in the order a FIFO claim must hand them out.
async fn enqueue_mixed_run_at(store: &dyn JobStore, now: chrono::DateTime<Utc>) -> Vec<Uuid> {
    let tied = now - chrono::Duration::minutes(5);
    let run_ats = [
        Some(now - chrono::Duration::minutes(1)),
        None,
        Some(now - chrono::Duration::minutes(10)),
        Some(tied),
        None,
        Some(tied),
    ];

    let mut rows = Vec::new();
    for run_at in run_ats {
        let mut new_job = job("acct-a", "bookings");
        new_job.run_at = run_at;
        rows.push((run_at, store.enqueue(new_job).await.unwrap()));
    }

    // None sorts before Some, matching NULLS FIRST
    rows.sort();
    rows.into_iter().map(|(_, id)| id).collect()
}

#[tokio::test]
async fn batch_claim_is_fifo_by_run_at_with_nulls_first() {
    let engine = memory_engine(Arc::new(ProbeBatchClaim));
    let now = Utc::now();
    let expected = enqueue_mixed_run_at(engine.store(), now).await;

    let first: Vec<Uuid> = engine
        .claim(3, "w1", now)
        .await
        .unwrap()
        .into_iter()
        .map(|h| h.job.id)
        .collect();
    assert_eq!(first, expected[..3]);
    for id in &first[..2] {
        let row = engine.store().get_job(*id).await.unwrap().unwrap();
        assert_eq!(row.run_at, None, "null run_at rows go first");
    }

    let rest: Vec<Uuid> = engine
        .claim(10, "w1", now)
        .await
        .unwrap()
        .into_iter()
        .map(|h| h.job.id)
        .collect();
    assert_eq!(rest, expected[3..]);
}

#[tokio::test]
async fn candidate_order_is_key_then_creation() {
    let engine = memory_engine(Arc::new(CandidateClaim));
    let store = engine.store();
    let now = Utc::now();

    // an old run_at does not jump the key order
    store
        .enqueue(job("acct-b", "links").run_at(now - chrono::Duration::hours(1)))
        .await
        .unwrap();
    for (cred, endpoint) in [
        ("acct-a", "rates"),
        ("acct-a", "links"),
        ("acct-b", "links"),
        ("acct-a", "links"),
    ] {
        store.enqueue(job(cred, endpoint)).await.unwrap();
    }

    let mut rows = store.jobs().unwrap();
    rows.sort_by(|a, b| {
        (&a.credential_key, &a.endpoint, a.created_at, a.id)
            .cmp(&(&b.credential_key, &b.endpoint, b.created_at, b.id))
    });
    let expected: Vec<Uuid> = rows.iter().map(|j| j.id).collect();
    assert_eq!(rows[0].homogeneity_key(), rows[1].homogeneity_key());
    assert_eq!(rows[0].credential_key, "acct-a");
    assert_eq!(rows[0].endpoint, "links");

    let claimed: Vec<Uuid> = engine
        .claim(10, "w1", now)
        .await
        .unwrap()
        .into_iter()
        .map(|h| h.job.id)
        .collect();
    assert_eq!(claimed, expected);
}
