// Shop integration - read-only client for a tenant's external order API

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::services::tenant_settings::ShopCredentials;

// Hard stop for a misbehaving API that never returns a short page.
const MAX_PAGES: u32 = 50;

#[derive(Error, Debug)]
pub enum IntegrationError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("shop API returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode shop response: {0}")]
    Decode(String),
}

pub type IntegrationResult<T> = Result<T, IntegrationError>;

/// One order as reported by the shop, with the raw item kept for automation payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalOrder {
    pub id: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub total: Option<f64>,
    pub raw: Value,
}

fn timestamp(item: &Value, snake: &str, camel: &str) -> Option<DateTime<Utc>> {
    item.get(snake)
        .or_else(|| item.get(camel))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl ExternalOrder {
    pub fn from_value(item: Value) -> IntegrationResult<Self> {
        let id = match item.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(IntegrationError::Decode("order without an id".to_string())),
        };

        let status = text(item.get("status"))
            .ok_or_else(|| IntegrationError::Decode(format!("order {} has no status", id)))?;

        let created_at = timestamp(&item, "created_at", "createdAt");
        let updated_at = timestamp(&item, "updated_at", "updatedAt")
            .or(created_at)
            .ok_or_else(|| IntegrationError::Decode(format!("order {} has no timestamp", id)))?;

        let customer = item.get("customer");
        let customer_email = text(customer.and_then(|c| c.get("email"))).or_else(|| text(item.get("customer_email")));
        let customer_name = text(customer.and_then(|c| c.get("name"))).or_else(|| text(item.get("customer_name")));

        let total = match item.get("total") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        };

        Ok(Self {
            id,
            status,
            updated_at,
            created_at,
            customer_email,
            customer_name,
            total,
            raw: item,
        })
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderSource: Send + Sync {
    /// Every order changed after `since`, across all pages.
    async fn orders_updated_since(
        &self,
        credentials: &ShopCredentials,
        since: DateTime<Utc>,
    ) -> IntegrationResult<Vec<ExternalOrder>>;
}

pub struct ShopClient {
    client: reqwest::Client,
    page_size: u32,
}

impl ShopClient {
    pub fn new(page_size: u32, timeout: Duration) -> IntegrationResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            page_size: page_size.max(1),
        })
    }

    async fn fetch_page(
        &self,
        credentials: &ShopCredentials,
        since: DateTime<Utc>,
        page: u32,
    ) -> IntegrationResult<Vec<Value>> {
        let response = self
            .client
            .get(format!("{}/orders", credentials.api_url))
            .bearer_auth(&credentials.api_key)
            .query(&[
                ("updated_after", since.to_rfc3339()),
                ("page", page.to_string()),
                ("per_page", self.page_size.to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(IntegrationError::Status { status, body });
        }

        match response.json::<Value>().await? {
            Value::Array(items) => Ok(items),
            Value::Object(mut body) => match body.remove("orders") {
                Some(Value::Array(items)) => Ok(items),
                _ => Err(IntegrationError::Decode("expected an 'orders' array".to_string())),
            },
            _ => Err(IntegrationError::Decode("expected a JSON array of orders".to_string())),
        }
    }
}

#[async_trait]
impl OrderSource for ShopClient {
    async fn orders_updated_since(
        &self,
        credentials: &ShopCredentials,
        since: DateTime<Utc>,
    ) -> IntegrationResult<Vec<ExternalOrder>> {
        let mut orders = Vec::new();

        for page in 1..=MAX_PAGES {
            let items = self.fetch_page(credentials, since, page).await?;
            let count = items.len();

            for item in items {
                orders.push(ExternalOrder::from_value(item)?);
            }

            debug!("Tenant {}: shop page {} returned {} order(s)", credentials.tenant_id, page, count);

            if count < self.page_size as usize {
                break;
            }
        }

        Ok(orders)
    }
}
