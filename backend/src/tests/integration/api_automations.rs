use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use kontor_shared::{EdgeLabel, RunStatus, TriggerType};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::jobs::JobScheduler;
use crate::tests::fixtures;
use crate::tests::helpers::EngineHarness;
use crate::{app, AppState};

async fn scheduler(harness: &EngineHarness) -> JobScheduler {
    JobScheduler::new(harness.engine.clone(), SchedulerConfig::default())
        .await
        .unwrap()
}

fn router_with(harness: &EngineHarness, scheduler: JobScheduler) -> Router {
    app(Arc::new(AppState {
        engine: harness.engine.clone(),
        scheduler,
    }))
}

async fn router(harness: &EngineHarness) -> Router {
    router_with(harness, scheduler(harness).await)
}

async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn test_health_endpoints() {
    let harness = EngineHarness::new();

    let (status, body) = send(router(&harness).await, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, _) = send(router(&harness).await, Method::GET, "/api/v1/automations/health", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_activate_without_trigger_is_unprocessable() {
    let harness = EngineHarness::new();
    let mut automation = fixtures::automation(TriggerType::OrderPaid, vec![fixtures::update_record("a")]);
    automation.active = false;
    let automation = harness.add(automation).await;

    let (status, body) = send(
        router(&harness).await,
        Method::POST,
        &format!("/api/v1/automations/{}/activate", automation.id),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert!(body["details"]["automation"].as_array().is_some_and(|issues| !issues.is_empty()));
    assert!(!harness.automation(automation.id).await.active);
}

#[tokio::test]
async fn test_activate_and_deactivate() {
    let harness = EngineHarness::new();
    let mut automation = fixtures::linear_automation(TriggerType::OrderPaid);
    automation.active = false;
    let automation = harness.add(automation).await;

    let (status, body) = send(
        router(&harness).await,
        Method::POST,
        &format!("/api/v1/automations/{}/activate", automation.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], true);

    let (status, body) = send(
        router(&harness).await,
        Method::POST,
        &format!("/api/v1/automations/{}/deactivate", automation.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], false);
    assert!(!harness.automation(automation.id).await.active);
}

#[tokio::test]
async fn test_unknown_automation_and_run_are_not_found() {
    let harness = EngineHarness::new();

    let (status, body) = send(
        router(&harness).await,
        Method::POST,
        &format!("/api/v1/automations/{}/trigger", Uuid::new_v4()),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = send(
        router(&harness).await,
        Method::GET,
        &format!("/api/v1/automations/runs/{}", Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manual_trigger_then_fetch_run() {
    let harness = EngineHarness::new();
    let automation = harness.add(fixtures::linear_automation(TriggerType::OrderPaid)).await;

    let (status, body) = send(
        router(&harness).await,
        Method::POST,
        &format!("/api/v1/automations/{}/trigger", automation.id),
        Some(json!({ "order": { "id": 5 } })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id: Uuid = serde_json::from_value(body["runId"].clone()).unwrap();

    harness.settled_run(run_id).await;

    let (status, body) = send(
        router(&harness).await,
        Method::GET,
        &format!("/api/v1/automations/runs/{}", run_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["triggerType"], "manual");
    assert_eq!(body["executionLog"].as_array().map(Vec::len), Some(4));

    let (status, body) = send(
        router(&harness).await,
        Method::GET,
        &format!("/api/v1/automations/{}/runs?limit=500", automation.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_retry_and_cancel_respect_run_state() {
    let harness = EngineHarness::new();
    let automation = harness
        .add(fixtures::automation(
            TriggerType::Manual,
            vec![
                fixtures::trigger("t").connect("pause", EdgeLabel::Default),
                fixtures::wait("pause", 3, "days"),
            ],
        ))
        .await;
    let (status, run) = harness.run_once(&automation, json!({})).await;
    assert_eq!(status, RunStatus::Waiting);

    let (status, body) = send(
        router(&harness).await,
        Method::POST,
        &format!("/api/v1/automations/runs/{}/retry", run.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    let (status, body) = send(
        router(&harness).await,
        Method::POST,
        &format!("/api/v1/automations/runs/{}/cancel", run.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");

    let (status, _) = send(
        router(&harness).await,
        Method::POST,
        &format!("/api/v1/automations/runs/{}/cancel", run.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        router(&harness).await,
        Method::POST,
        &format!("/api/v1/automations/runs/{}/retry", run.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["runId"].is_string());
}

#[tokio::test]
async fn test_event_ingestion() {
    let harness = EngineHarness::new();
    let tenant_id = Uuid::new_v4();
    harness
        .add(fixtures::automation_for_tenant(
            tenant_id,
            TriggerType::QuoteSigned,
            fixtures::linear_automation(TriggerType::QuoteSigned).nodes,
        ))
        .await;

    let (status, body) = send(
        router(&harness).await,
        Method::POST,
        "/api/v1/automations/events",
        Some(json!({
            "triggerType": "quote.signed",
            "payload": { "quote": { "id": 11 } },
            "scope": { "tenantId": tenant_id }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["outcomes"].as_array().map(Vec::len), Some(1));

    let (status, body) = send(
        router(&harness).await,
        Method::POST,
        "/api/v1/automations/events",
        Some(json!({ "triggerType": "quote.rejected", "payload": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_job_status_lists_cron_triggers_and_passes() {
    let harness = EngineHarness::new();
    let automation = harness.add(fixtures::scheduled_automation("30 6 * * *")).await;

    let scheduler = scheduler(&harness).await;
    scheduler.run_schedule_refresh().await;
    scheduler.run_resume_scan().await;

    let (status, body) = send(
        router_with(&harness, scheduler),
        Method::GET,
        "/api/v1/automations/jobs",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scheduled"][automation.id.to_string()]["expression"], "0 30 6 * * *");
    let jobs: Vec<&str> = body["executions"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|log| log["job_name"].as_str())
        .collect();
    assert_eq!(jobs, vec!["Schedule Refresh", "Resume Scan"]);
}
