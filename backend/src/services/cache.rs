use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Expiring cache backed by the `cache_entries` table, shared by every instance.
#[derive(Clone)]
pub struct CacheService {
    pool: PgPool,
}

impl CacheService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a value from cache, or compute and store it if not present
    pub async fn get_or_set<T, F, Fut>(&self, key: &str, ttl_seconds: i32, compute: F) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CacheResult<T>>,
    {
        if let Some(cached) = self.get::<T>(key).await? {
            return Ok(cached);
        }

        let value = compute().await?;
        self.set(key, &value, ttl_seconds).await?;

        Ok(value)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let row: Option<(JsonValue,)> = sqlx::query_as(
            r#"
            UPDATE cache_entries SET hit_count = hit_count + 1
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            RETURNING value
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((value,)) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_seconds: i32) -> CacheResult<()> {
        let json_value = serde_json::to_value(value)?;

        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
            SET value = $2, expires_at = NOW() + make_interval(secs => $3), updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(json_value)
        .bind(f64::from(ttl_seconds))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

pub mod cache_keys {
    use super::Uuid;

    pub fn tenant_settings(tenant_id: Uuid) -> String {
        format!("tenant:{}:settings", tenant_id)
    }
}
