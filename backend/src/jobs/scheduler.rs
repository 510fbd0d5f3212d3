// Job Scheduler - Resumes waiting runs and keeps cron-triggered automations scheduled

use chrono::{DateTime, Utc};
use futures::future::join_all;
use kontor_shared::{DispatchScope, TriggerType};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::integrations::IntegrationError;
use crate::services::tenant_settings::SettingsError;
use crate::workflows::{AutomationEngine, EngineError};

const MAX_EXECUTION_LOGS: usize = 100;
const RESUME_BATCH_LIMIT: i64 = 500;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Engine error: {0}")]
    EngineError(#[from] EngineError),
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("Integration error: {0}")]
    IntegrationError(#[from] IntegrationError),
    #[error("Tenant settings error: {0}")]
    SettingsError(#[from] SettingsError),
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
}

pub type JobResult<T> = Result<T, JobError>;

/// Accepts 5-field (minute-first) or 6-field (second-first) cron and returns the 6-field form.
pub fn normalize_cron_expression(expression: &str) -> JobResult<String> {
    let invalid = |reason: String| JobError::InvalidCron {
        expression: expression.to_string(),
        reason,
    };

    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => format!("0 {}", fields.join(" ")),
        6 => fields.join(" "),
        n => return Err(invalid(format!("expected 5 or 6 fields, got {}", n))),
    };

    // parsed by the same scheduler that will run it
    Job::new_async(normalized.as_str(), |_uuid, _lock| Box::pin(async {}))
        .map_err(|e| invalid(e.to_string()))?;
    Ok(normalized)
}

/// Fixed period for the background duties, at least one minute.
fn every_minutes(minutes: u32) -> StdDuration {
    StdDuration::from_secs(u64::from(minutes.max(1)) * 60)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: i32,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    PartialFailure,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumeSummary {
    pub found: usize,
    pub resumed: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshSummary {
    pub active: usize,
    pub added: usize,
    pub removed: usize,
    pub errors: Vec<String>,
}

/// A live cron job firing one automation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTrigger {
    pub job_id: Uuid,
    pub expression: String,
}

#[derive(Clone)]
pub struct JobScheduler {
    scheduler: TokioScheduler,
    engine: Arc<AutomationEngine>,
    config: SchedulerConfig,
    schedules: Arc<Mutex<HashMap<Uuid, ScheduledTrigger>>>,
    execution_logs: Arc<RwLock<Vec<JobExecutionLog>>>,
}

impl JobScheduler {
    pub async fn new(engine: Arc<AutomationEngine>, config: SchedulerConfig) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            engine,
            config,
            schedules: Arc::new(Mutex::new(HashMap::new())),
            execution_logs: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting automation scheduler");

        // Catch up on anything that came due while the process was down.
        self.run_resume_scan().await;
        self.run_schedule_refresh().await;

        self.schedule_resume_scan().await?;
        self.schedule_refresh().await?;

        self.scheduler.start().await?;

        info!("Automation scheduler started");
        Ok(())
    }

    pub async fn shutdown(&self) -> JobResult<()> {
        info!("Shutting down automation scheduler");
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        Ok(())
    }

    /// Resumes every waiting run whose time has come, each on its own task.
    pub async fn resume_due_runs(&self) -> JobResult<ResumeSummary> {
        let due = self.engine.due_runs(RESUME_BATCH_LIMIT).await?;
        let mut summary = ResumeSummary {
            found: due.len(),
            ..Default::default()
        };

        let handles: Vec<_> = due
            .iter()
            .map(|&run_id| {
                let engine = self.engine.clone();
                tokio::spawn(async move { engine.resume_run(run_id).await })
            })
            .collect();

        for (run_id, result) in due.iter().zip(join_all(handles).await) {
            match result {
                Ok(Ok(Some(status))) => {
                    info!("Resumed run {} -> {}", run_id, status);
                    summary.resumed += 1;
                }
                Ok(Ok(None)) => summary.skipped += 1,
                Ok(Err(e)) => {
                    error!("Failed to resume run {}: {}", run_id, e);
                    summary.errors.push(format!("{}: {}", run_id, e));
                }
                Err(e) => {
                    error!("Resume task for run {} did not finish: {}", run_id, e);
                    summary.errors.push(format!("{}: {}", run_id, e));
                }
            }
        }

        Ok(summary)
    }

    /// Reconciles live cron jobs with the active `time.schedule` automations.
    pub async fn refresh_schedules(&self) -> JobResult<RefreshSummary> {
        let automations = self.engine.scheduled_automations().await?;
        let mut summary = RefreshSummary::default();

        let mut desired: HashMap<Uuid, (Uuid, String)> = HashMap::new();
        for automation in &automations {
            let Some(raw) = automation.trigger_config.cron.as_deref() else {
                warn!("Automation {} has a time.schedule trigger but no cron expression", automation.id);
                summary.errors.push(format!("{}: missing cron expression", automation.id));
                continue;
            };
            match normalize_cron_expression(raw) {
                Ok(expression) => {
                    desired.insert(automation.id, (automation.tenant_id, expression));
                }
                Err(e) => {
                    warn!("Automation {} not scheduled: {}", automation.id, e);
                    summary.errors.push(format!("{}: {}", automation.id, e));
                }
            }
        }

        let mut schedules = self.schedules.lock().await;

        let stale: Vec<Uuid> = schedules
            .iter()
            .filter(|(id, live)| desired.get(id).map_or(true, |(_, expr)| *expr != live.expression))
            .map(|(id, _)| *id)
            .collect();

        for automation_id in stale {
            if let Some(live) = schedules.remove(&automation_id) {
                if let Err(e) = self.scheduler.remove(&live.job_id).await {
                    warn!("Could not remove cron job for automation {}: {}", automation_id, e);
                }
                info!("Unscheduled automation {} ({})", automation_id, live.expression);
                summary.removed += 1;
            }
        }

        for (automation_id, (tenant_id, expression)) in desired {
            if schedules.contains_key(&automation_id) {
                continue;
            }
            match self.add_trigger_job(automation_id, tenant_id, &expression).await {
                Ok(job_id) => {
                    info!("Scheduled automation {} with '{}'", automation_id, expression);
                    schedules.insert(automation_id, ScheduledTrigger { job_id, expression });
                    summary.added += 1;
                }
                Err(e) => {
                    error!("Failed to schedule automation {}: {}", automation_id, e);
                    summary.errors.push(format!("{}: {}", automation_id, e));
                }
            }
        }

        summary.active = schedules.len();
        Ok(summary)
    }

    async fn add_trigger_job(&self, automation_id: Uuid, tenant_id: Uuid, expression: &str) -> JobResult<Uuid> {
        let engine = self.engine.clone();

        let job = Job::new_async(expression, move |_uuid, _lock| {
            let engine = engine.clone();

            Box::pin(async move {
                let payload = json!({
                    "automationId": automation_id,
                    "scheduledAt": Utc::now().to_rfc3339(),
                });
                let scope = DispatchScope::automation(tenant_id, automation_id);

                match engine.fire(TriggerType::TimeSchedule, payload, &scope).await {
                    Ok(report) => info!(
                        "Cron tick for automation {} started {} run(s)",
                        automation_id,
                        report.outcomes.iter().filter(|o| o.run_id.is_some()).count()
                    ),
                    Err(e) => error!("Cron tick for automation {} failed: {}", automation_id, e),
                }
            })
        })?;

        Ok(self.scheduler.add(job).await?)
    }

    /// One resume pass, recorded in the execution log.
    pub async fn run_resume_scan(&self) {
        let started_at = Utc::now();
        let result = self.resume_due_runs().await;
        let log = match result {
            Ok(summary) => {
                info!(
                    "Resume scan: {} due, {} resumed, {} skipped, {} failed",
                    summary.found,
                    summary.resumed,
                    summary.skipped,
                    summary.errors.len()
                );
                finished_log("Resume Scan", started_at, summary.resumed, summary.errors)
            }
            Err(e) => {
                error!("Resume scan failed: {}", e);
                failed_log("Resume Scan", started_at, e)
            }
        };
        push_log(&self.execution_logs, log).await;
    }

    pub async fn run_schedule_refresh(&self) {
        let started_at = Utc::now();
        let result = self.refresh_schedules().await;
        let log = match result {
            Ok(summary) => {
                info!(
                    "Schedule refresh: {} active, {} added, {} removed, {} invalid",
                    summary.active,
                    summary.added,
                    summary.removed,
                    summary.errors.len()
                );
                finished_log("Schedule Refresh", started_at, summary.added + summary.removed, summary.errors)
            }
            Err(e) => {
                error!("Schedule refresh failed: {}", e);
                failed_log("Schedule Refresh", started_at, e)
            }
        };
        push_log(&self.execution_logs, log).await;
    }

    async fn schedule_resume_scan(&self) -> JobResult<()> {
        let interval = self.config.resume_scan_interval_minutes;
        let this = self.clone();

        let job = Job::new_repeated_async(every_minutes(interval), move |_uuid, _lock| {
            let this = this.clone();
            Box::pin(async move { this.run_resume_scan().await })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled resume scan every {} minutes", interval);

        Ok(())
    }

    async fn schedule_refresh(&self) -> JobResult<()> {
        let interval = self.config.schedule_refresh_interval_minutes;
        let this = self.clone();

        let job = Job::new_repeated_async(every_minutes(interval), move |_uuid, _lock| {
            let this = this.clone();
            Box::pin(async move { this.run_schedule_refresh().await })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled automation schedule refresh every {} minutes", interval);

        Ok(())
    }

    pub async fn scheduled_triggers(&self) -> HashMap<Uuid, ScheduledTrigger> {
        self.schedules.lock().await.clone()
    }

    pub async fn get_execution_logs(&self) -> Vec<JobExecutionLog> {
        self.execution_logs.read().await.clone()
    }
}

fn finished_log(job_name: &str, started_at: DateTime<Utc>, processed: usize, errors: Vec<String>) -> JobExecutionLog {
    let completed_at = Utc::now();
    JobExecutionLog {
        id: Uuid::new_v4(),
        job_name: job_name.to_string(),
        started_at,
        completed_at: Some(completed_at),
        status: if errors.is_empty() {
            JobStatus::Completed
        } else {
            JobStatus::PartialFailure
        },
        items_processed: i32::try_from(processed).unwrap_or(i32::MAX),
        errors,
        duration_ms: Some((completed_at - started_at).num_milliseconds()),
    }
}

fn failed_log(job_name: &str, started_at: DateTime<Utc>, error: JobError) -> JobExecutionLog {
    let completed_at = Utc::now();
    JobExecutionLog {
        id: Uuid::new_v4(),
        job_name: job_name.to_string(),
        started_at,
        completed_at: Some(completed_at),
        status: JobStatus::Failed,
        items_processed: 0,
        errors: vec![error.to_string()],
        duration_ms: Some((completed_at - started_at).num_milliseconds()),
    }
}

async fn push_log(logs: &RwLock<Vec<JobExecutionLog>>, log: JobExecutionLog) {
    let mut logs = logs.write().await;
    logs.push(log);
    // Keep only the most recent entries
    if logs.len() > MAX_EXECUTION_LOGS {
        let overflow = logs.len() - MAX_EXECUTION_LOGS;
        logs.drain(..overflow);
    }
}
