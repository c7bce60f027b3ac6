use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::PoolSettings;
use crate::error::Result;

pub async fn make_pool(database_url: &str, settings: &PoolSettings) -> Result<PgPool> {
    let mut opts = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout);

    // claim queries are short; JIT compilation only adds latency to them
    if settings.disable_jit {
        opts = opts.after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("SET jit = OFF").execute(&mut *conn).await?;
                Ok(())
            })
        });
    }

    let pool = opts.connect(database_url).await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
