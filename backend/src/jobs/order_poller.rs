// Order Poller - Turns changed shop orders into order.* triggers, once per order and status

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use kontor_shared::{DispatchScope, TriggerType};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::scheduler::JobResult;
use crate::config::PollerConfig;
use crate::integrations::{ExternalOrder, OrderSource};
use crate::services::tenant_settings::{TenantSettings, TenantSettingsProvider};
use crate::workflows::TriggerSink;

/// External order status -> internal trigger. Anything else fires nothing.
pub fn trigger_for_status(status: &str) -> Option<TriggerType> {
    match status.trim().to_ascii_lowercase().as_str() {
        "pending" => Some(TriggerType::OrderCreated),
        "paid" => Some(TriggerType::OrderPaid),
        "shipped" => Some(TriggerType::OrderShipped),
        "delivered" => Some(TriggerType::OrderDelivered),
        _ => None,
    }
}

/// Trigger payload for a polled order.
pub fn order_payload(order: &ExternalOrder) -> Value {
    json!({
        "order": order.raw,
        "status": order.status,
        "externalId": order.id,
        "customer": {
            "email": order.customer_email,
            "name": order.customer_name,
        },
        "source": "shop",
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollAudit {
    pub tenant_id: Uuid,
    pub polled_at: DateTime<Utc>,
    pub fetched: i32,
    pub fired: i32,
    pub skipped: i32,
    pub checkpoint: Option<DateTime<Utc>>,
}

/// Checkpoints, the processed-event ledger and the poll audit trail.
#[async_trait]
pub trait PollerStateStore: Send + Sync {
    async fn checkpoint(&self, tenant_id: Uuid) -> JobResult<Option<DateTime<Utc>>>;

    async fn save_checkpoint(&self, tenant_id: Uuid, checkpoint: DateTime<Utc>, polled_at: DateTime<Utc>) -> JobResult<()>;

    async fn is_processed(&self, tenant_id: Uuid, external_id: &str, trigger_type: TriggerType) -> JobResult<bool>;

    async fn mark_processed(&self, tenant_id: Uuid, external_id: &str, trigger_type: TriggerType) -> JobResult<()>;

    async fn record_audit(&self, audit: &PollAudit) -> JobResult<()>;
}

pub struct PgPollerState {
    db_pool: PgPool,
}

impl PgPollerState {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl PollerStateStore for PgPollerState {
    async fn checkpoint(&self, tenant_id: Uuid) -> JobResult<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT last_checkpoint FROM order_poll_checkpoints WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_optional(&self.db_pool)
                .await?;

        Ok(row.map(|(checkpoint,)| checkpoint))
    }

    async fn save_checkpoint(&self, tenant_id: Uuid, checkpoint: DateTime<Utc>, polled_at: DateTime<Utc>) -> JobResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_poll_checkpoints (tenant_id, last_checkpoint, last_polled_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id) DO UPDATE
            SET last_checkpoint = GREATEST(order_poll_checkpoints.last_checkpoint, $2),
                last_polled_at = $3
            "#,
        )
        .bind(tenant_id)
        .bind(checkpoint)
        .bind(polled_at)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn is_processed(&self, tenant_id: Uuid, external_id: &str, trigger_type: TriggerType) -> JobResult<bool> {
        let exists: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM processed_external_events
                WHERE tenant_id = $1 AND external_id = $2 AND trigger_type = $3
            )
            "#,
        )
        .bind(tenant_id)
        .bind(external_id)
        .bind(trigger_type.as_str())
        .fetch_one(&self.db_pool)
        .await?;

        Ok(exists.0)
    }

    async fn mark_processed(&self, tenant_id: Uuid, external_id: &str, trigger_type: TriggerType) -> JobResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_external_events (tenant_id, external_id, trigger_type)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(external_id)
        .bind(trigger_type.as_str())
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn record_audit(&self, audit: &PollAudit) -> JobResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_poll_audit (tenant_id, polled_at, fetched, fired, skipped, checkpoint)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(audit.tenant_id)
        .bind(audit.polled_at)
        .bind(audit.fetched)
        .bind(audit.fired)
        .bind(audit.skipped)
        .bind(audit.checkpoint)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TenantPollReport {
    pub fetched: usize,
    pub fired: usize,
    pub skipped: usize,
    pub failed: usize,
    pub checkpoint: Option<DateTime<Utc>>,
}

pub struct OrderPoller {
    settings: Arc<dyn TenantSettingsProvider>,
    source: Arc<dyn OrderSource>,
    sink: Arc<dyn TriggerSink>,
    state: Arc<dyn PollerStateStore>,
    config: PollerConfig,
    last_polled: Mutex<HashMap<Uuid, Instant>>,
}

impl OrderPoller {
    pub fn new(
        settings: Arc<dyn TenantSettingsProvider>,
        source: Arc<dyn OrderSource>,
        sink: Arc<dyn TriggerSink>,
        state: Arc<dyn PollerStateStore>,
        config: PollerConfig,
    ) -> Self {
        Self {
            settings,
            source,
            sink,
            state,
            config,
            last_polled: Mutex::new(HashMap::new()),
        }
    }

    /// Runs forever, waking every `tick_secs` to poll the tenants that are due.
    pub async fn start(&self) {
        if !self.config.enabled {
            info!("Order poller is disabled");
            return;
        }

        info!("Starting order poller (tick every {}s)", self.config.tick_secs);
        let mut ticker = interval(Duration::from_secs(self.config.tick_secs));

        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_due_tenants().await {
                error!("Order poller tick failed: {}", e);
            }
        }
    }

    /// Polls every tenant whose interval has elapsed, concurrently and independently.
    pub async fn poll_due_tenants(&self) -> JobResult<HashMap<Uuid, TenantPollReport>> {
        let tenants = self.settings.polling_tenants().await?;
        let due = self.take_due(tenants).await;

        let results = join_all(due.iter().map(|tenant| self.poll_tenant(tenant))).await;

        let mut reports = HashMap::new();
        for (tenant, result) in due.iter().zip(results) {
            match result {
                Ok(report) => {
                    reports.insert(tenant.tenant_id, report);
                }
                Err(e) => warn!("Order poll for tenant {} failed: {}", tenant.tenant_id, e),
            }
        }

        Ok(reports)
    }

    async fn take_due(&self, tenants: Vec<TenantSettings>) -> Vec<TenantSettings> {
        let now = Instant::now();
        let mut last_polled = self.last_polled.lock().await;

        tenants
            .into_iter()
            .filter(|tenant| {
                let every = Duration::from_secs(self.config.interval_for(tenant.poll_interval()));
                let due = last_polled
                    .get(&tenant.tenant_id)
                    .map_or(true, |last| now.duration_since(*last) >= every);
                if due {
                    last_polled.insert(tenant.tenant_id, now);
                }
                due
            })
            .collect()
    }

    pub async fn poll_tenant(&self, tenant: &TenantSettings) -> JobResult<TenantPollReport> {
        let tenant_id = tenant.tenant_id;
        let Some(credentials) = tenant.shop_credentials() else {
            debug!("Tenant {} has no shop credentials, skipping poll", tenant_id);
            return Ok(TenantPollReport::default());
        };

        let polled_at = Utc::now();
        let since = match self.state.checkpoint(tenant_id).await? {
            Some(checkpoint) => checkpoint,
            None => polled_at - ChronoDuration::minutes(self.config.initial_lookback_minutes),
        };

        let orders = self.source.orders_updated_since(&credentials, since).await?;
        let mut report = TenantPollReport {
            fetched: orders.len(),
            ..Default::default()
        };

        for order in &orders {
            let Some(trigger_type) = trigger_for_status(&order.status) else {
                report.skipped += 1;
                continue;
            };

            if self.state.is_processed(tenant_id, &order.id, trigger_type).await? {
                report.skipped += 1;
                continue;
            }

            match self
                .sink
                .fire(trigger_type, order_payload(order), DispatchScope::tenant(tenant_id))
                .await
            {
                Ok(outcomes) => {
                    self.state.mark_processed(tenant_id, &order.id, trigger_type).await?;
                    debug!(
                        "Tenant {}: order {} fired {} for {} automation(s)",
                        tenant_id,
                        order.id,
                        trigger_type,
                        outcomes.len()
                    );
                    report.fired += 1;
                }
                Err(e) => {
                    // left out of the ledger so the next poll retries it
                    warn!("Tenant {}: dispatch of order {} failed: {}", tenant_id, order.id, e);
                    report.failed += 1;
                }
            }
        }

        let newest = orders.iter().map(|o| o.updated_at).max();
        if report.failed == 0 {
            if let Some(checkpoint) = newest {
                self.state.save_checkpoint(tenant_id, checkpoint, polled_at).await?;
                report.checkpoint = Some(checkpoint);
            }
        }

        self.state
            .record_audit(&PollAudit {
                tenant_id,
                polled_at,
                fetched: count(report.fetched),
                fired: count(report.fired),
                skipped: count(report.skipped),
                checkpoint: report.checkpoint,
            })
            .await?;

        info!(
            "Order poll for tenant {}: {} fetched, {} fired, {} skipped, {} failed",
            tenant_id, report.fetched, report.fired, report.skipped, report.failed
        );

        Ok(report)
    }
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
