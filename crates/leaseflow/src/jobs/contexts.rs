use serde_json::Value;
use sqlx::PgPool;

use crate::error::Result;
use crate::jobs::model::{ChannelContext, HomogeneityKey};

/// Channel connection settings, one row per credential/endpoint pair.
#[derive(Clone)]
pub struct ContextsRepo {
    pool: PgPool,
}

impl ContextsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_context(&self, key: &HomogeneityKey) -> Result<Option<ChannelContext>> {
        let rec = sqlx::query_as::<_, ChannelContext>(
            r#"
            SELECT credential_key, endpoint, base_url, settings_json, active, updated_at
            FROM channel_contexts
            WHERE credential_key = $1 AND endpoint = $2
            "#,
        )
        .bind(&key.credential_key)
        .bind(&key.endpoint)
        .fetch_optional(&self.pool)
        .await?;

        Ok(rec)
    }

    pub async fn upsert_context(
        &self,
        key: &HomogeneityKey,
        base_url: &str,
        settings_json: &Value,
        active: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channel_contexts(credential_key, endpoint, base_url, settings_json, active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT(credential_key, endpoint) DO UPDATE
            SET base_url = EXCLUDED.base_url,
                settings_json = EXCLUDED.settings_json,
                active = EXCLUDED.active,
                updated_at = now()
            "#,
        )
        .bind(&key.credential_key)
        .bind(&key.endpoint)
        .bind(base_url)
        .bind(settings_json)
        .bind(active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// One round trip for every distinct key of a claimed batch.
pub(crate) async fn fetch_many(
    pool: &PgPool,
    keys: &[HomogeneityKey],
) -> Result<Vec<ChannelContext>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }

    let (creds, endpoints): (Vec<String>, Vec<String>) = keys
        .iter()
        .map(|k| (k.credential_key.clone(), k.endpoint.clone()))
        .unzip();

    let rows = sqlx::query_as::<_, ChannelContext>(
        r#"
        SELECT c.credential_key, c.endpoint, c.base_url, c.settings_json, c.active, c.updated_at
        FROM channel_contexts c
        JOIN unnest($1::text[], $2::text[]) AS k(credential_key, endpoint)
          ON c.credential_key = k.credential_key
         AND c.endpoint = k.endpoint
        "#,
    )
    .bind(&creds)
    .bind(&endpoints)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
