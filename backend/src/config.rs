use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub server_addr: String,
    pub smtp: SmtpConfig,
    pub scheduler: SchedulerConfig,
    pub poller: PollerConfig,
    pub webhook: WebhookConfig,
    pub tenant_settings_cache_ttl_secs: i32,
}

/// SMTP configuration for automation emails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
    pub from_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub resume_scan_interval_minutes: u32,
    pub schedule_refresh_interval_minutes: u32,
}

/// External order polling. Per-tenant intervals come from tenant settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    pub enabled: bool,
    /// How often the poller wakes up to look for due tenants (seconds)
    pub tick_secs: u64,
    pub default_interval_secs: u64,
    pub min_interval_secs: u64,
    pub initial_lookback_minutes: i64,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub timeout_secs: u64,
    /// Hosts exempt from the private-network check (scheme check still applies)
    pub allowed_hosts: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            resume_scan_interval_minutes: 1,
            schedule_refresh_interval_minutes: 5,
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: 15,
            default_interval_secs: 60,
            min_interval_secs: 30,
            initial_lookback_minutes: 60,
            page_size: 100,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            allowed_hosts: Vec::new(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let scheduler_defaults = SchedulerConfig::default();
        let poller_defaults = PollerConfig::default();
        let webhook_defaults = WebhookConfig::default();

        let database_url = env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .context("DATABASE_URL must be set")?;

        Ok(Config {
            database_url,
            server_addr: env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            smtp: SmtpConfig {
                host: env::var("SMTP_HOST").unwrap_or_default(),
                port: env_or("SMTP_PORT", 587),
                username: env::var("SMTP_USERNAME").unwrap_or_default(),
                password: env::var("SMTP_PASSWORD").unwrap_or_default(),
                from_email: env::var("SMTP_FROM_EMAIL")
                    .unwrap_or_else(|_| "automations@kontor.local".to_string()),
                from_name: env::var("SMTP_FROM_NAME").unwrap_or_else(|_| "Kontor".to_string()),
            },
            scheduler: SchedulerConfig {
                resume_scan_interval_minutes: env_or(
                    "RESUME_SCAN_INTERVAL_MINUTES",
                    scheduler_defaults.resume_scan_interval_minutes,
                )
                .max(1),
                schedule_refresh_interval_minutes: env_or(
                    "SCHEDULE_REFRESH_INTERVAL_MINUTES",
                    scheduler_defaults.schedule_refresh_interval_minutes,
                )
                .max(1),
            },
            poller: PollerConfig {
                enabled: env_or("ORDER_POLLER_ENABLED", poller_defaults.enabled),
                tick_secs: env_or("ORDER_POLLER_TICK_SECS", poller_defaults.tick_secs).max(1),
                default_interval_secs: env_or(
                    "ORDER_POLLER_DEFAULT_INTERVAL_SECS",
                    poller_defaults.default_interval_secs,
                ),
                min_interval_secs: env_or(
                    "ORDER_POLLER_MIN_INTERVAL_SECS",
                    poller_defaults.min_interval_secs,
                ),
                initial_lookback_minutes: env_or(
                    "ORDER_POLLER_INITIAL_LOOKBACK_MINUTES",
                    poller_defaults.initial_lookback_minutes,
                ),
                page_size: env_or("ORDER_POLLER_PAGE_SIZE", poller_defaults.page_size).clamp(1, 500),
            },
            webhook: WebhookConfig {
                timeout_secs: env_or("WEBHOOK_TIMEOUT_SECS", webhook_defaults.timeout_secs),
                allowed_hosts: env::var("WEBHOOK_ALLOWED_HOSTS")
                    .map(|raw| parse_host_list(&raw))
                    .unwrap_or_default(),
            },
            tenant_settings_cache_ttl_secs: env_or("TENANT_SETTINGS_CACHE_TTL_SECS", 300),
        })
    }
}

impl SmtpConfig {
    /// Check if SMTP is properly configured
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && !self.username.is_empty() && !self.password.is_empty()
    }
}

impl PollerConfig {
    /// Effective polling interval for a tenant, never below the floor.
    pub fn interval_for(&self, tenant_interval_secs: Option<u64>) -> u64 {
        tenant_interval_secs
            .unwrap_or(self.default_interval_secs)
            .max(self.min_interval_secs)
    }
}
