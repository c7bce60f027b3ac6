use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::jobs::{Job, JobStore, QueueStats};

/// Read-only admin surface served next to a worker.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn JobStore>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/stats", get(stats))
        .route("/metrics/prom", get(metrics_prom))
        .route("/jobs/:id", get(get_job))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub now_utc: DateTime<Utc>,
    #[serde(flatten)]
    pub stats: QueueStats,
}

fn internal_err(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("internal error: {e}"))
}

pub async fn stats(
    State(state): State<ApiState>,
) -> Result<Json<StatsResponse>, (StatusCode, String)> {
    let now = Utc::now();
    let stats = state.store.stats(now).await.map_err(internal_err)?;
    Ok(Json(StatsResponse { now_utc: now, stats }))
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Response {
    match state.store.stats(Utc::now()).await {
        Ok(s) => (StatusCode::OK, render_prom(&s)).into_response(),
        Err(e) => internal_err(e).into_response(),
    }
}

/// Prometheus text exposition, one gauge family per figure.
fn render_prom(s: &QueueStats) -> String {
    let q = &s.queue;
    let mut out = String::new();

    out.push_str("# HELP leaseflow_jobs Jobs per status\n");
    out.push_str("# TYPE leaseflow_jobs gauge\n");
    for (status, n) in [
        ("pending", s.pending),
        ("processing", s.processing),
        ("succeeded", s.succeeded),
        ("retrying", s.retrying),
        ("failed", s.failed),
        ("cancelled", s.cancelled),
    ] {
        out.push_str(&format!(
            "leaseflow_jobs{{queue=\"{q}\",status=\"{status}\"}} {n}\n"
        ));
    }

    out.push_str("# HELP leaseflow_runnable_jobs Jobs claimable right now\n");
    out.push_str("# TYPE leaseflow_runnable_jobs gauge\n");
    out.push_str(&format!(
        "leaseflow_runnable_jobs{{queue=\"{q}\"}} {}\n",
        s.runnable
    ));

    out.push_str("# HELP leaseflow_exhausted_jobs Jobs with no attempts left\n");
    out.push_str("# TYPE leaseflow_exhausted_jobs gauge\n");
    out.push_str(&format!(
        "leaseflow_exhausted_jobs{{queue=\"{q}\"}} {}\n",
        s.exhausted
    ));

    out
}

pub async fn get_job(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
) -> Result<Json<Job>, (StatusCode, String)> {
    match state.store.get_job(id).await.map_err(internal_err)? {
        Some(job) => Ok(Json(job)),
        None => Err((StatusCode::NOT_FOUND, "job not found".into())),
    }
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{MemoryJobStore, NewJob};

    fn state(store: &MemoryJobStore) -> ApiState {
        ApiState {
            store: Arc::new(store.clone()),
        }
    }

    #[tokio::test]
    async fn stats_counts_waiting_jobs() {
        let store = MemoryJobStore::new("exchange");
        store.enqueue(NewJob::new(Uuid::now_v7())).await.unwrap();
        store.enqueue(NewJob::new(Uuid::now_v7())).await.unwrap();

        let Json(body) = stats(State(state(&store))).await.unwrap();
        assert_eq!(body.stats.queue, "exchange");
        assert_eq!(body.stats.pending, 2);
        assert_eq!(body.stats.runnable, 2);
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let store = MemoryJobStore::new("exchange");
        let err = get_job(Path(Uuid::now_v7()), State(state(&store)))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[test]
    fn prom_output_labels_queue_and_status() {
        let s = QueueStats {
            queue: "pull".into(),
            retrying: 4,
            ..QueueStats::default()
        };
        let text = render_prom(&s);
        assert!(text.contains("leaseflow_jobs{queue=\"pull\",status=\"retrying\"} 4"));
        assert!(text.contains("leaseflow_runnable_jobs{queue=\"pull\"} 0"));
    }
}
