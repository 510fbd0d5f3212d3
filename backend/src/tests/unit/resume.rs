use chrono::{Duration as ChronoDuration, Utc};
use kontor_shared::{EdgeLabel, NodeLogStatus, RunStatus, TriggerType};
use serde_json::json;

use crate::config::SchedulerConfig;
use crate::jobs::JobScheduler;
use crate::tests::fixtures;
use crate::tests::helpers::{executed_nodes, EngineHarness};

fn waiting_automation() -> kontor_shared::Automation {
    fixtures::automation(
        TriggerType::OrderShipped,
        vec![
            fixtures::trigger("t").connect("before", EdgeLabel::Default),
            fixtures::update_record("before").connect("pause", EdgeLabel::Default),
            fixtures::wait("pause", 1, "minutes").connect("after", EdgeLabel::Default),
            fixtures::update_record("after"),
        ],
    )
}

#[tokio::test]
async fn test_wait_suspends_and_resume_continues_after_the_wait_node() {
    let harness = EngineHarness::new();
    let automation = harness.add(waiting_automation()).await;

    let started = Utc::now();
    let (status, run) = harness.run_once(&automation, fixtures::order_event(10.0)).await;

    assert_eq!(status, RunStatus::Waiting);
    assert_eq!(run.current_node_id.as_deref(), Some("pause"));
    let resume_at = run.scheduled_at.expect("waiting run has a resume time");
    let expected = started + ChronoDuration::seconds(60);
    assert!((resume_at - expected).num_seconds().abs() <= 5);
    assert_eq!(run.execution_log.last().map(|e| e.status), Some(NodeLogStatus::Waiting));

    // not due yet
    assert!(harness.engine.due_runs(10).await.unwrap().is_empty());

    let scheduler = JobScheduler::new(harness.engine.clone(), SchedulerConfig::default())
        .await
        .unwrap();
    let summary = scheduler.resume_due_runs().await.unwrap();
    assert_eq!(summary.found, 0);

    harness.runs.reschedule(run.id, Utc::now() - ChronoDuration::seconds(1)).await;
    assert_eq!(harness.engine.due_runs(10).await.unwrap(), vec![run.id]);

    let summary = scheduler.resume_due_runs().await.unwrap();
    assert_eq!(summary.found, 1);
    assert_eq!(summary.resumed, 1);
    assert!(summary.errors.is_empty());

    let resumed = harness.engine.get_run(run.id).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(executed_nodes(&resumed), vec!["t", "before", "pause", "after"]);
    assert!(resumed.context.get("node_before").is_some());
    assert!(resumed.context.get("node_after").is_some());

    // one logical run, counted once
    let stats = harness.automation(automation.id).await.stats;
    assert_eq!(stats.total_runs, 1);
    assert_eq!(stats.successful_runs, 1);

    assert_eq!(harness.engine.resume_run(run.id).await.unwrap(), None);
}

#[tokio::test]
async fn test_concurrent_resumes_continue_the_run_once() {
    let harness = EngineHarness::new();
    let automation = harness.add(waiting_automation()).await;

    let (_, run) = harness.run_once(&automation, json!({})).await;
    harness.runs.reschedule(run.id, Utc::now() - ChronoDuration::seconds(1)).await;

    let (a, b) = tokio::join!(harness.engine.resume_run(run.id), harness.engine.resume_run(run.id));
    let claimed = [a.unwrap(), b.unwrap()].into_iter().flatten().count();
    assert_eq!(claimed, 1);

    let run = harness.engine.get_run(run.id).await.unwrap();
    assert_eq!(executed_nodes(&run).iter().filter(|id| **id == "after").count(), 1);
}

#[tokio::test]
async fn test_sibling_branch_runs_before_the_run_parks() {
    let harness = EngineHarness::new();
    let automation = harness
        .add(fixtures::automation(
            TriggerType::Manual,
            vec![
                fixtures::trigger("t")
                    .connect("pause", EdgeLabel::Default)
                    .connect("now", EdgeLabel::Default),
                fixtures::wait("pause", 2, "hours").connect("later", EdgeLabel::Default),
                fixtures::update_record("now"),
                fixtures::update_record("later"),
            ],
        ))
        .await;

    let (status, run) = harness.run_once(&automation, json!({})).await;

    assert_eq!(status, RunStatus::Waiting);
    assert_eq!(executed_nodes(&run), vec!["t", "pause", "now"]);
    assert_eq!(run.current_node_id.as_deref(), Some("pause"));
}

#[tokio::test]
async fn test_second_wait_in_one_pass_fails_the_run() {
    let harness = EngineHarness::new();
    let automation = harness
        .add(fixtures::automation(
            TriggerType::Manual,
            vec![
                fixtures::trigger("t")
                    .connect("w1", EdgeLabel::Default)
                    .connect("w2", EdgeLabel::Default),
                fixtures::wait("w1", 1, "days"),
                fixtures::wait("w2", 1, "days"),
            ],
        ))
        .await;

    let (status, run) = harness.run_once(&automation, json!({})).await;

    assert_eq!(status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap_or_default().contains("one node at a time"));
}

#[tokio::test]
async fn test_cancelling_a_waiting_run_prevents_resume() {
    let harness = EngineHarness::new();
    let automation = harness.add(waiting_automation()).await;

    let (_, run) = harness.run_once(&automation, json!({})).await;
    let cancelled = harness.engine.cancel_run(run.id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    harness.runs.reschedule(run.id, Utc::now() - ChronoDuration::seconds(1)).await;
    assert!(harness.engine.due_runs(10).await.unwrap().is_empty());
    assert_eq!(harness.engine.resume_run(run.id).await.unwrap(), None);

    let stats = harness.automation(automation.id).await.stats;
    assert_eq!(stats.total_runs, 1);
    assert_eq!(stats.successful_runs + stats.failed_runs, 0);
}

#[tokio::test]
async fn test_zero_minute_wait_resumes_on_the_next_scan() {
    let harness = EngineHarness::new();
    let automation = harness
        .add(fixtures::automation(
            TriggerType::Manual,
            vec![
                fixtures::trigger("t").connect("pause", EdgeLabel::Default),
                fixtures::wait("pause", 0, "minutes").connect("after", EdgeLabel::Default),
                fixtures::update_record("after"),
            ],
        ))
        .await;

    let (status, run) = harness.run_once(&automation, json!({})).await;
    assert_eq!(status, RunStatus::Waiting);
    assert!(run.scheduled_at.is_some_and(|at| at <= Utc::now()));

    let scheduler = JobScheduler::new(harness.engine.clone(), SchedulerConfig::default())
        .await
        .unwrap();
    let summary = scheduler.resume_due_runs().await.unwrap();
    assert_eq!(summary.resumed, 1);

    let resumed = harness.engine.get_run(run.id).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(executed_nodes(&resumed), vec!["t", "pause", "after"]);
}
