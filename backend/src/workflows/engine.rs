// Workflow Engine - Operator-facing entry point over dispatch, execution and run bookkeeping

use chrono::Utc;
use kontor_shared::{Automation, AutomationRun, DispatchOutcome, DispatchScope, RunStatus, TriggerType};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::actions::ActionRegistry;
use super::executor::AutomationExecutor;
use super::graph::validate_for_activation;
use super::store::{AutomationStore, RunOutcome, RunStore, StoreError};
use super::triggers::{supervise, DispatchReport, TriggerDispatcher};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("automation cannot be activated: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("automation {0} not found")]
    AutomationNotFound(Uuid),
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("cannot {action} run {run_id} while it is {status}")]
    InvalidState {
        run_id: Uuid,
        status: RunStatus,
        action: &'static str,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;

pub struct AutomationEngine {
    automations: Arc<dyn AutomationStore>,
    runs: Arc<dyn RunStore>,
    executor: Arc<AutomationExecutor>,
    dispatcher: TriggerDispatcher,
}

impl AutomationEngine {
    pub fn new(automations: Arc<dyn AutomationStore>, runs: Arc<dyn RunStore>, actions: ActionRegistry) -> Self {
        let executor = Arc::new(AutomationExecutor::new(automations.clone(), runs.clone(), actions));
        let dispatcher = TriggerDispatcher::new(automations.clone(), runs.clone(), executor.clone());

        Self {
            automations,
            runs,
            executor,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &TriggerDispatcher {
        &self.dispatcher
    }

    pub async fn activate(&self, automation_id: Uuid) -> EngineResult<Automation> {
        let mut automation = self
            .automations
            .get(automation_id)
            .await?
            .ok_or(EngineError::AutomationNotFound(automation_id))?;

        let issues = validate_for_activation(&automation);
        if !issues.is_empty() {
            return Err(EngineError::Validation(issues));
        }

        self.automations.set_active(automation_id, true).await?;
        automation.active = true;

        info!("Automation {} '{}' activated", automation.id, automation.name);
        Ok(automation)
    }

    pub async fn deactivate(&self, automation_id: Uuid) -> EngineResult<()> {
        if !self.automations.set_active(automation_id, false).await? {
            return Err(EngineError::AutomationNotFound(automation_id));
        }

        info!("Automation {} deactivated", automation_id);
        Ok(())
    }

    pub async fn fire(
        &self,
        trigger_type: TriggerType,
        payload: Value,
        scope: &DispatchScope,
    ) -> EngineResult<DispatchReport> {
        self.dispatcher.fire_trigger(trigger_type, payload, scope).await
    }

    /// Starts one `manual` run of a specific automation, whatever its configured trigger.
    pub async fn trigger_manual(&self, automation_id: Uuid, payload: Value) -> EngineResult<DispatchOutcome> {
        let automation = self
            .automations
            .get(automation_id)
            .await?
            .ok_or(EngineError::AutomationNotFound(automation_id))?;

        let (run_id, handle) = self.dispatcher.start_run(&automation, TriggerType::Manual, payload).await?;
        supervise(vec![(run_id, handle)]);

        info!("Manual run {} started for automation {}", run_id, automation_id);
        Ok(DispatchOutcome {
            automation_id,
            run_id: Some(run_id),
            error: None,
        })
    }

    /// Re-runs a finished run's original payload as a brand-new run.
    pub async fn retry_run(&self, run_id: Uuid) -> EngineResult<DispatchOutcome> {
        let previous = self.get_run(run_id).await?;
        if !previous.status.is_terminal() {
            return Err(EngineError::InvalidState {
                run_id,
                status: previous.status,
                action: "retry",
            });
        }

        let automation = self
            .automations
            .get(previous.automation_id)
            .await?
            .ok_or(EngineError::AutomationNotFound(previous.automation_id))?;

        let (new_run_id, handle) = self
            .dispatcher
            .start_run(&automation, previous.trigger_type, previous.trigger_data)
            .await?;
        supervise(vec![(new_run_id, handle)]);

        info!("Run {} retried as {}", run_id, new_run_id);
        Ok(DispatchOutcome {
            automation_id: automation.id,
            run_id: Some(new_run_id),
            error: None,
        })
    }

    /// Cancels a non-terminal run. A running run stops at its next node boundary.
    pub async fn cancel_run(&self, run_id: Uuid) -> EngineResult<AutomationRun> {
        let now = Utc::now();

        match self.runs.cancel(run_id, now).await? {
            Some(previous) => {
                info!("Run {} cancelled (was {})", run_id, previous);
                // An in-flight executor owns a running run and records the outcome itself.
                if previous != RunStatus::Running {
                    let run = self.get_run(run_id).await?;
                    let outcome = RunOutcome {
                        status: RunStatus::Cancelled,
                        error: None,
                        finished_at: now,
                    };
                    self.automations.record_outcome(run.automation_id, &outcome).await?;
                    return Ok(run);
                }
                self.get_run(run_id).await
            }
            None => {
                let run = self.get_run(run_id).await?;
                Err(EngineError::InvalidState {
                    run_id,
                    status: run.status,
                    action: "cancel",
                })
            }
        }
    }

    pub async fn get_run(&self, run_id: Uuid) -> EngineResult<AutomationRun> {
        self.runs.get(run_id).await?.ok_or(EngineError::RunNotFound(run_id))
    }

    pub async fn list_runs(&self, automation_id: Uuid, limit: i64) -> EngineResult<Vec<AutomationRun>> {
        Ok(self.runs.list_for_automation(automation_id, limit).await?)
    }

    pub async fn due_runs(&self, limit: i64) -> EngineResult<Vec<Uuid>> {
        Ok(self.runs.list_due(Utc::now(), limit).await?)
    }

    pub async fn resume_run(&self, run_id: Uuid) -> EngineResult<Option<RunStatus>> {
        self.executor.resume_run(run_id).await
    }

    /// Active automations driven by a cron schedule.
    pub async fn scheduled_automations(&self) -> EngineResult<Vec<Automation>> {
        Ok(self.automations.list_active(TriggerType::TimeSchedule, None).await?)
    }
}
