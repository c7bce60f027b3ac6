use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use leaseflow::api;
use leaseflow::config::Config;
use leaseflow::db;
use leaseflow::jobs::{
    Exchange, HydratedJob, LinkSync, PgJobStore, Pull, QueueEngine, QueueKind, QueueKindName,
    QueueSettings, RateDelivery,
};
use leaseflow::telemetry;
use sqlx::PgPool;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

mod handlers;
use handlers::{DispatchError, Dispatcher, DryRunDispatcher};

/// Upper bound on the pause after a storage error.
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    let cfg = Config::from_env()?;

    let settings = cfg.queue_settings();
    info!(
        worker_id = %cfg.worker_id,
        queue = %cfg.queue,
        claim_limit = cfg.claim_limit,
        lease_ttl_secs = settings.lease_ttl.num_seconds(),
        db_max_connections = cfg.pool.max_connections,
        poll_interval_ms = cfg.poll_interval_ms,
        admin = cfg.admin_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        "leaseflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url, &cfg.pool).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    // ---- Admin task ----
    let admin_addr = cfg.admin_addr.clone();
    let app = api::router(api::ApiState {
        store: leaseflow::jobs::store_for(cfg.queue, pool.clone()),
    });
    let api_handle = tokio::spawn(async move {
        if let Some(addr) = admin_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(%addr, "admin api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Worker loop task ----
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(DryRunDispatcher);
    let worker_handle = tokio::spawn(run_kind(cfg.clone(), pool, settings, dispatcher));

    tokio::select! {
        res = api_handle => res??,
        res = worker_handle => res??,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    Ok(())
}

async fn run_kind(
    cfg: Config,
    pool: PgPool,
    settings: QueueSettings,
    dispatcher: Arc<dyn Dispatcher>,
) -> anyhow::Result<()> {
    match cfg.queue {
        QueueKindName::Exchange => run::<Exchange>(cfg, pool, settings, dispatcher).await,
        QueueKindName::LinkSync => run::<LinkSync>(cfg, pool, settings, dispatcher).await,
        QueueKindName::RateDelivery => run::<RateDelivery>(cfg, pool, settings, dispatcher).await,
        QueueKindName::Pull => run::<Pull>(cfg, pool, settings, dispatcher).await,
    }
}

async fn run<K: QueueKind>(
    cfg: Config,
    pool: PgPool,
    settings: QueueSettings,
    dispatcher: Arc<dyn Dispatcher>,
) -> anyhow::Result<()> {
    let engine = QueueEngine::<PgJobStore<K>>::for_kind(pool, &settings);
    let idle = Duration::from_millis(cfg.poll_interval_ms.max(10));
    // a dispatch must finish well inside the lease or the watchdog takes the job back
    let dispatch_timeout = settings
        .lease_ttl
        .to_std()
        .map(|ttl| ttl / 2)
        .unwrap_or(Duration::from_secs(30));

    info!(queue = K::NAME, strategy = engine.strategy_name(), "claim loop running");

    let mut error_backoff = idle;
    loop {
        let batch = match engine.claim(cfg.claim_limit, &cfg.worker_id, Utc::now()).await {
            Ok(batch) => {
                error_backoff = idle;
                batch
            }
            Err(e) => {
                error!(queue = K::NAME, error = %e, "claim failed");
                tokio::time::sleep(error_backoff).await;
                error_backoff = (error_backoff * 2).min(MAX_ERROR_BACKOFF);
                continue;
            }
        };

        if batch.is_empty() {
            tokio::time::sleep(idle).await;
            continue;
        }

        let mut join_set = JoinSet::new();
        for hydrated in batch {
            let dispatcher = Arc::clone(&dispatcher);
            join_set.spawn(async move {
                let result = match tokio::time::timeout(dispatch_timeout, dispatcher.dispatch(&hydrated)).await {
                    Ok(result) => result,
                    Err(_) => Err(DispatchError::new("dispatch_timeout")),
                };
                (hydrated, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (hydrated, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // the lease expires and the watchdog hands the job out again
                    error!(queue = K::NAME, error = %e, "dispatch task panicked");
                    continue;
                }
            };
            report(&engine, &hydrated, result).await;
        }
    }
}

async fn report<K: QueueKind>(
    engine: &QueueEngine<PgJobStore<K>>,
    hydrated: &HydratedJob,
    result: Result<(), DispatchError>,
) {
    let job = &hydrated.job;
    let now = Utc::now();

    let outcome = match result {
        Ok(()) => engine.mark_success(job, now).await,
        Err(err) => {
            engine
                .report_failure(job, &err.message, err.http_code, now)
                .await
        }
    };

    if let Err(e) = outcome {
        warn!(queue = K::NAME, job_id = %job.id, error = %e, "could not record outcome");
    }
}
