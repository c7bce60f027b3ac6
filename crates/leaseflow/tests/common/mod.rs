#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use leaseflow::jobs::{
    ChannelContext, ClaimStrategy, MemoryJobStore, NewJob, QueueEngine, QueueSettings,
};
use serde_json::json;
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

/// Fresh, migrated, empty database, or `None` when `TEST_DATABASE_URL` is unset.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query(
        r#"
        TRUNCATE TABLE
            exchange_jobs,
            link_sync_jobs,
            rate_delivery_jobs,
            pull_jobs,
            channel_contexts
        "#,
    )
    .execute(&pool)
    .await
    .expect("truncate failed");

    Some(pool)
}

pub fn memory_engine(strategy: Arc<dyn ClaimStrategy>) -> QueueEngine<MemoryJobStore> {
    QueueEngine::new(
        MemoryJobStore::new("test"),
        strategy,
        &QueueSettings::default(),
    )
}

pub fn job(credential_key: &str, endpoint: &str) -> NewJob {
    NewJob::new(Uuid::now_v7()).context(credential_key, endpoint)
}

pub fn context(credential_key: &str, endpoint: &str) -> ChannelContext {
    ChannelContext {
        credential_key: credential_key.to_string(),
        endpoint: endpoint.to_string(),
        base_url: format!("https://{credential_key}.channel.test"),
        settings_json: json!({ "endpoint": endpoint }),
        active: true,
        updated_at: Utc::now(),
    }
}
