use axum::{http::Method, routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod database;
mod error;
mod handlers;
mod integrations;
mod jobs;
mod services;
mod workflows;

#[cfg(test)]
mod tests;

use integrations::ShopClient;
use jobs::{JobScheduler, OrderPoller, PgPollerState};
use services::{CacheService, EmailService, PgTenantSettings};
use workflows::store::{PgAutomationStore, PgRunStore};
use workflows::webhook::WebhookClient;
use workflows::{ActionRegistry, AutomationEngine};

pub struct AppState {
    pub engine: Arc<AutomationEngine>,
    pub scheduler: JobScheduler,
}

pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Kontor Automation Engine" }))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/automations", handlers::automation_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kontor_backend=debug")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let email = Arc::new(EmailService::new(&config.smtp, db_pool.clone())?);
    if !config.smtp.is_configured() {
        tracing::warn!("SMTP is not configured, send_email actions will fail");
    }

    let settings = Arc::new(PgTenantSettings::new(
        db_pool.clone(),
        CacheService::new(db_pool.clone()),
        config.tenant_settings_cache_ttl_secs,
    ));

    let actions = ActionRegistry::new(email, settings.clone(), WebhookClient::new(&config.webhook));
    let engine = Arc::new(AutomationEngine::new(
        Arc::new(PgAutomationStore::new(db_pool.clone())),
        Arc::new(PgRunStore::new(db_pool.clone())),
        actions,
    ));

    let scheduler = JobScheduler::new(engine.clone(), config.scheduler.clone()).await?;
    scheduler.start().await?;

    let poller = OrderPoller::new(
        settings,
        Arc::new(ShopClient::new(config.poller.page_size, Duration::from_secs(30))?),
        Arc::new(engine.dispatcher().clone()),
        Arc::new(PgPollerState::new(db_pool.clone())),
        config.poller.clone(),
    );
    tokio::spawn(async move { poller.start().await });

    let app_state = Arc::new(AppState {
        engine,
        scheduler: scheduler.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app(app_state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    scheduler.shutdown().await?;

    Ok(())
}
