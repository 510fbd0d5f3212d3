// Tenant Settings - per-tenant configuration consumed by the automation engine

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use uuid::Uuid;

use super::cache::{cache_keys, CacheError, CacheService};

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("no settings for tenant {0}")]
    NotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct TenantSettings {
    pub tenant_id: Uuid,
    pub admin_email: Option<String>,
    pub shop_api_url: Option<String>,
    pub shop_api_key: Option<String>,
    pub poll_interval_secs: Option<i64>,
    pub poller_enabled: bool,
}

/// Credentials for a tenant's external shop API.
#[derive(Debug, Clone, PartialEq)]
pub struct ShopCredentials {
    pub tenant_id: Uuid,
    pub api_url: String,
    pub api_key: String,
}

impl TenantSettings {
    pub fn empty(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            admin_email: None,
            shop_api_url: None,
            shop_api_key: None,
            poll_interval_secs: None,
            poller_enabled: false,
        }
    }

    pub fn shop_credentials(&self) -> Option<ShopCredentials> {
        match (&self.shop_api_url, &self.shop_api_key) {
            (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => Some(ShopCredentials {
                tenant_id: self.tenant_id,
                api_url: url.trim_end_matches('/').to_string(),
                api_key: key.clone(),
            }),
            _ => None,
        }
    }

    pub fn poll_interval(&self) -> Option<u64> {
        self.poll_interval_secs.and_then(|s| u64::try_from(s).ok())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TenantSettingsProvider: Send + Sync {
    async fn settings(&self, tenant_id: Uuid) -> Result<TenantSettings, SettingsError>;

    /// Tenants with polling switched on and shop credentials present.
    async fn polling_tenants(&self) -> Result<Vec<TenantSettings>, SettingsError>;
}

pub struct PgTenantSettings {
    pool: PgPool,
    cache: CacheService,
    ttl_secs: i32,
}

impl PgTenantSettings {
    pub fn new(pool: PgPool, cache: CacheService, ttl_secs: i32) -> Self {
        Self { pool, cache, ttl_secs }
    }

    async fn fetch(&self, tenant_id: Uuid) -> Result<Option<TenantSettings>, sqlx::Error> {
        sqlx::query_as::<_, TenantSettings>(
            r#"
            SELECT tenant_id, admin_email, shop_api_url, shop_api_key, poll_interval_secs, poller_enabled
            FROM tenant_settings
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[async_trait]
impl TenantSettingsProvider for PgTenantSettings {
    async fn settings(&self, tenant_id: Uuid) -> Result<TenantSettings, SettingsError> {
        let cached: Option<TenantSettings> = self
            .cache
            .get_or_set(&cache_keys::tenant_settings(tenant_id), self.ttl_secs, || async {
                Ok(self.fetch(tenant_id).await?)
            })
            .await?;

        cached.ok_or(SettingsError::NotFound(tenant_id))
    }

    async fn polling_tenants(&self) -> Result<Vec<TenantSettings>, SettingsError> {
        let tenants = sqlx::query_as::<_, TenantSettings>(
            r#"
            SELECT tenant_id, admin_email, shop_api_url, shop_api_key, poll_interval_secs, poller_enabled
            FROM tenant_settings
            WHERE poller_enabled = TRUE
              AND shop_api_url IS NOT NULL
              AND shop_api_key IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(tenants)
    }
}
