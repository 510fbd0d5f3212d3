use kontor_shared::{DispatchScope, EdgeLabel, RunStatus, TriggerType};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use crate::tests::fixtures;
use crate::tests::helpers::EngineHarness;

#[tokio::test]
async fn test_fan_out_isolates_a_failing_automation() {
    let harness = EngineHarness::new();
    let tenant_id = Uuid::new_v4();

    let first = harness
        .add(fixtures::automation_for_tenant(
            tenant_id,
            TriggerType::OrderPaid,
            fixtures::linear_automation(TriggerType::OrderPaid).nodes,
        ))
        .await;
    let second = harness
        .add(fixtures::automation_for_tenant(
            tenant_id,
            TriggerType::OrderPaid,
            fixtures::linear_automation(TriggerType::OrderPaid).nodes,
        ))
        .await;
    // send_email without a template fails at execution time
    let broken = harness
        .add(fixtures::automation_for_tenant(
            tenant_id,
            TriggerType::OrderPaid,
            vec![
                fixtures::trigger("t").connect("mail", EdgeLabel::Default),
                fixtures::send_email("mail", " ", "customer"),
            ],
        ))
        .await;

    let report = harness
        .engine
        .fire(TriggerType::OrderPaid, fixtures::order_event(99.0), &DispatchScope::tenant(tenant_id))
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 3);
    assert!(report.outcomes.iter().all(|o| o.run_id.is_some() && o.error.is_none()));

    tokio::time::timeout(Duration::from_secs(10), report.completion)
        .await
        .expect("dispatch should settle")
        .unwrap();

    let runs = harness.runs.all().await;
    assert_eq!(runs.len(), 3);
    assert_eq!(runs.iter().filter(|r| r.status == RunStatus::Completed).count(), 2);
    let failed: Vec<_> = runs.iter().filter(|r| r.status == RunStatus::Failed).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].automation_id, broken.id);

    for id in [first.id, second.id] {
        assert_eq!(harness.automation(id).await.stats.successful_runs, 1);
    }
    assert_eq!(harness.automation(broken.id).await.stats.failed_runs, 1);
}

#[tokio::test]
async fn test_only_active_automations_of_the_fired_type_run() {
    let harness = EngineHarness::new();
    let tenant_id = Uuid::new_v4();

    let matching = harness
        .add(fixtures::automation_for_tenant(
            tenant_id,
            TriggerType::InvoicePaid,
            fixtures::linear_automation(TriggerType::InvoicePaid).nodes,
        ))
        .await;

    let mut inactive = fixtures::automation_for_tenant(tenant_id, TriggerType::InvoicePaid, matching.nodes.clone());
    inactive.active = false;
    harness.add(inactive).await;

    harness
        .add(fixtures::automation_for_tenant(
            tenant_id,
            TriggerType::InvoiceOverdue,
            matching.nodes.clone(),
        ))
        .await;

    // another tenant's automation is out of scope
    harness
        .add(fixtures::automation(TriggerType::InvoicePaid, matching.nodes.clone()))
        .await;

    let report = harness
        .engine
        .fire(TriggerType::InvoicePaid, json!({ "invoice": { "id": 7 } }), &DispatchScope::tenant(tenant_id))
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].automation_id, matching.id);
    report.completion.await.unwrap();
}

#[tokio::test]
async fn test_trigger_config_filters_by_status_and_site() {
    let harness = EngineHarness::new();
    let tenant_id = Uuid::new_v4();
    let nodes = fixtures::linear_automation(TriggerType::OrderPaid).nodes;

    let mut paid_only = fixtures::automation_for_tenant(tenant_id, TriggerType::OrderPaid, nodes.clone());
    paid_only.trigger_config.status = Some("paid".to_string());
    let paid_only = harness.add(paid_only).await;

    let mut other_site = fixtures::automation_for_tenant(tenant_id, TriggerType::OrderPaid, nodes.clone());
    other_site.trigger_config.site_id = Some("site-b".to_string());
    harness.add(other_site).await;

    let scope = DispatchScope {
        tenant_id: Some(tenant_id),
        site_id: Some("site-a".to_string()),
        automation_id: None,
    };

    let report = harness
        .engine
        .fire(TriggerType::OrderPaid, json!({ "status": "paid" }), &scope)
        .await
        .unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].automation_id, paid_only.id);
    report.completion.await.unwrap();

    let report = harness
        .engine
        .fire(TriggerType::OrderPaid, json!({ "status": "refunded" }), &scope)
        .await
        .unwrap();
    assert!(report.outcomes.is_empty());
}

#[tokio::test]
async fn test_manual_trigger_runs_inactive_automation() {
    let harness = EngineHarness::new();
    let mut automation = fixtures::linear_automation(TriggerType::OrderShipped);
    automation.active = false;
    let automation = harness.add(automation).await;

    let outcome = harness
        .engine
        .trigger_manual(automation.id, json!({ "note": "by hand" }))
        .await
        .unwrap();

    let run = harness.settled_run(outcome.run_id.unwrap()).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.trigger_type, TriggerType::Manual);
    assert_eq!(run.trigger_data, json!({ "note": "by hand" }));
}

#[tokio::test]
async fn test_retry_replays_the_original_payload_as_a_new_run() {
    let harness = EngineHarness::new();
    let automation = harness.add(fixtures::linear_automation(TriggerType::OrderPaid)).await;
    let payload = fixtures::order_event(12.5);

    let (_, first) = harness.run_once(&automation, payload.clone()).await;
    let outcome = harness.engine.retry_run(first.id).await.unwrap();

    let retried = harness.settled_run(outcome.run_id.unwrap()).await;
    assert_ne!(retried.id, first.id);
    assert_eq!(retried.trigger_type, TriggerType::OrderPaid);
    assert_eq!(retried.trigger_data, payload);
    assert_eq!(retried.status, RunStatus::Completed);
}
