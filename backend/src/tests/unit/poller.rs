use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kontor_shared::TriggerType;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::config::PollerConfig;
use crate::integrations::shop::{IntegrationError, MockOrderSource};
use crate::integrations::{OrderSource, ShopClient};
use crate::jobs::OrderPoller;
use crate::services::tenant_settings::MockTenantSettingsProvider;
use crate::tests::fixtures;
use crate::tests::helpers::{init_test_logging, InMemoryPollerState};
use crate::workflows::triggers::MockTriggerSink;
use crate::workflows::EngineError;

fn poller(
    settings: MockTenantSettingsProvider,
    source: MockOrderSource,
    sink: MockTriggerSink,
    state: Arc<InMemoryPollerState>,
) -> OrderPoller {
    init_test_logging();
    OrderPoller::new(
        Arc::new(settings),
        Arc::new(source),
        Arc::new(sink),
        state,
        PollerConfig::default(),
    )
}

#[tokio::test]
async fn test_same_order_and_status_fires_once() {
    let tenant = fixtures::polling_tenant("https://shop.example.com/api");
    let updated_at = Utc::now() - ChronoDuration::minutes(5);
    let order = fixtures::external_order("1001", "paid", updated_at);

    let mut source = MockOrderSource::new();
    source
        .expect_orders_updated_since()
        .times(2)
        .returning(move |_, _| Ok(vec![order.clone()]));

    let tenant_id = tenant.tenant_id;
    let mut sink = MockTriggerSink::new();
    sink.expect_fire()
        .withf(move |trigger, payload, scope| {
            *trigger == TriggerType::OrderPaid
                && payload["externalId"] == json!("1001")
                && scope.tenant_id == Some(tenant_id)
        })
        .times(1)
        .returning(|_, _, _| Ok(Vec::new()));

    let state = Arc::new(InMemoryPollerState::default());
    let poller = poller(MockTenantSettingsProvider::new(), source, sink, state.clone());

    let first = poller.poll_tenant(&tenant).await.unwrap();
    assert_eq!(first.fetched, 1);
    assert_eq!(first.fired, 1);
    assert_eq!(first.checkpoint, Some(updated_at));

    let second = poller.poll_tenant(&tenant).await.unwrap();
    assert_eq!(second.fetched, 1);
    assert_eq!(second.fired, 0);
    assert_eq!(second.skipped, 1);

    assert_eq!(state.audits.lock().await.len(), 2);
}

#[tokio::test]
async fn test_status_change_fires_the_new_trigger() {
    let tenant = fixtures::polling_tenant("https://shop.example.com/api");
    let paid = fixtures::external_order("2002", "paid", Utc::now() - ChronoDuration::minutes(10));
    let shipped = fixtures::external_order("2002", "shipped", Utc::now() - ChronoDuration::minutes(1));

    let calls = AtomicUsize::new(0);
    let mut source = MockOrderSource::new();
    source.expect_orders_updated_since().returning(move |_, _| {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(vec![paid.clone()])
        } else {
            Ok(vec![shipped.clone()])
        }
    });

    let fired = Arc::new(Mutex::new(Vec::new()));
    let seen = fired.clone();
    let mut sink = MockTriggerSink::new();
    sink.expect_fire().times(2).returning(move |trigger, _, _| {
        seen.lock().unwrap().push(trigger);
        Ok(Vec::new())
    });

    let poller = poller(
        MockTenantSettingsProvider::new(),
        source,
        sink,
        Arc::new(InMemoryPollerState::default()),
    );

    poller.poll_tenant(&tenant).await.unwrap();
    poller.poll_tenant(&tenant).await.unwrap();

    assert_eq!(*fired.lock().unwrap(), vec![TriggerType::OrderPaid, TriggerType::OrderShipped]);
}

#[tokio::test]
async fn test_first_poll_looks_back_then_resumes_from_checkpoint() {
    let tenant = fixtures::polling_tenant("https://shop.example.com/api");
    let updated_at = Utc::now() - ChronoDuration::minutes(3);
    let order = fixtures::external_order("3003", "refunded", updated_at);

    let requested: Arc<Mutex<Vec<DateTime<Utc>>>> = Arc::new(Mutex::new(Vec::new()));
    let record = requested.clone();
    let mut source = MockOrderSource::new();
    source.expect_orders_updated_since().returning(move |_, since| {
        record.lock().unwrap().push(since);
        Ok(vec![order.clone()])
    });

    // unmapped statuses never reach the sink
    let mut sink = MockTriggerSink::new();
    sink.expect_fire().times(0);

    let started = Utc::now();
    let poller = poller(
        MockTenantSettingsProvider::new(),
        source,
        sink,
        Arc::new(InMemoryPollerState::default()),
    );

    let report = poller.poll_tenant(&tenant).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.checkpoint, Some(updated_at));

    poller.poll_tenant(&tenant).await.unwrap();

    let requested = requested.lock().unwrap();
    let lookback = started - requested[0];
    assert!((lookback.num_minutes() - 60).abs() <= 1);
    assert_eq!(requested[1], updated_at);
}

#[tokio::test]
async fn test_failed_dispatch_is_retried_on_next_poll() {
    let tenant = fixtures::polling_tenant("https://shop.example.com/api");
    let order = fixtures::external_order("4004", "delivered", Utc::now() - ChronoDuration::minutes(2));

    let mut source = MockOrderSource::new();
    source
        .expect_orders_updated_since()
        .returning(move |_, _| Ok(vec![order.clone()]));

    let attempts = AtomicUsize::new(0);
    let mut sink = MockTriggerSink::new();
    sink.expect_fire().times(2).returning(move |_, _, _| {
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(EngineError::Validation(vec!["store unavailable".to_string()]))
        } else {
            Ok(Vec::new())
        }
    });

    let state = Arc::new(InMemoryPollerState::default());
    let poller = poller(MockTenantSettingsProvider::new(), source, sink, state.clone());

    let first = poller.poll_tenant(&tenant).await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.checkpoint, None);
    assert!(state.checkpoints.lock().await.is_empty());

    let second = poller.poll_tenant(&tenant).await.unwrap();
    assert_eq!(second.fired, 1);
    assert!(second.checkpoint.is_some());
}

#[tokio::test]
async fn test_one_failing_tenant_does_not_stop_the_others() {
    let healthy = fixtures::polling_tenant("https://good.example.com");
    let broken = fixtures::polling_tenant("https://bad.example.com");
    let healthy_id = healthy.tenant_id;
    let broken_id = broken.tenant_id;

    let mut settings = MockTenantSettingsProvider::new();
    let tenants = vec![healthy.clone(), broken.clone()];
    settings
        .expect_polling_tenants()
        .times(2)
        .returning(move || Ok(tenants.clone()));

    let order = fixtures::external_order("5005", "pending", Utc::now() - ChronoDuration::minutes(1));
    let mut source = MockOrderSource::new();
    source
        .expect_orders_updated_since()
        .times(2)
        .returning(move |credentials, _| {
            if credentials.tenant_id == broken_id {
                Err(IntegrationError::Status {
                    status: 503,
                    body: "maintenance".to_string(),
                })
            } else {
                Ok(vec![order.clone()])
            }
        });

    let mut sink = MockTriggerSink::new();
    sink.expect_fire()
        .withf(move |trigger, _, scope| *trigger == TriggerType::OrderCreated && scope.tenant_id == Some(healthy_id))
        .times(1)
        .returning(|_, _, _| Ok(Vec::new()));

    let poller = poller(settings, source, sink, Arc::new(InMemoryPollerState::default()));

    let reports = poller.poll_due_tenants().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[&healthy_id].fired, 1);

    // neither tenant is due again yet
    let reports = poller.poll_due_tenants().await.unwrap();
    assert!(reports.is_empty());
}

#[tokio::test]
async fn test_tenant_without_credentials_is_not_polled() {
    let mut tenant = fixtures::polling_tenant("https://shop.example.com");
    tenant.shop_api_key = None;

    let mut source = MockOrderSource::new();
    source.expect_orders_updated_since().times(0);

    let poller = poller(
        MockTenantSettingsProvider::new(),
        source,
        MockTriggerSink::new(),
        Arc::new(InMemoryPollerState::default()),
    );

    let report = poller.poll_tenant(&tenant).await.unwrap();
    assert_eq!(report.fetched, 0);
}

#[tokio::test]
async fn test_shop_client_pages_until_a_short_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(query_param("page", "1"))
        .and(query_param("per_page", "2"))
        .and(header("authorization", "Bearer test-shop-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 1, "status": "paid", "updated_at": "2026-05-01T10:00:00Z" },
            { "id": 2, "status": "shipped", "updated_at": "2026-05-01T11:00:00Z" }
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "orders": [
                {
                    "id": "3",
                    "status": "delivered",
                    "updatedAt": "2026-05-01T12:00:00Z",
                    "customer": { "email": "ada@example.com" }
                }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let tenant = fixtures::polling_tenant(&server.uri());
    let client = ShopClient::new(2, Duration::from_secs(5)).unwrap();
    let since = Utc::now() - ChronoDuration::hours(1);

    let orders = client
        .orders_updated_since(&tenant.shop_credentials().unwrap(), since)
        .await
        .unwrap();

    let ids: Vec<&str> = orders.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(orders[2].customer_email.as_deref(), Some("ada@example.com"));
}

#[tokio::test]
async fn test_shop_client_surfaces_error_status() {
    let server = MockServer::start().await;
    Mock::given(path("/orders"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let tenant = fixtures::polling_tenant(&server.uri());
    let client = ShopClient::new(50, Duration::from_secs(5)).unwrap();

    let result = client
        .orders_updated_since(&tenant.shop_credentials().unwrap(), Utc::now())
        .await;

    assert!(matches!(result, Err(IntegrationError::Status { status: 401, .. })));
}
