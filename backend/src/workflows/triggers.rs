// Workflow Triggers - Maps an event onto new runs of every matching automation

use async_trait::async_trait;
use futures::future::join_all;
use kontor_shared::{Automation, AutomationRun, DispatchOutcome, DispatchScope, RunStatus, TriggerType};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::engine::EngineResult;
use super::executor::AutomationExecutor;
use super::store::{AutomationStore, RunStore};

/// Anything that can turn an event into automation runs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TriggerSink: Send + Sync {
    async fn fire(
        &self,
        trigger_type: TriggerType,
        payload: Value,
        scope: DispatchScope,
    ) -> EngineResult<Vec<DispatchOutcome>>;
}

/// A spawned run and the task executing it.
pub type RunTask = (Uuid, JoinHandle<EngineResult<RunStatus>>);

/// Per-automation bookkeeping plus a handle that resolves once every spawned run has settled.
pub struct DispatchReport {
    pub outcomes: Vec<DispatchOutcome>,
    pub completion: JoinHandle<()>,
}

#[derive(Clone)]
pub struct TriggerDispatcher {
    automations: Arc<dyn AutomationStore>,
    runs: Arc<dyn RunStore>,
    executor: Arc<AutomationExecutor>,
}

impl TriggerDispatcher {
    pub fn new(
        automations: Arc<dyn AutomationStore>,
        runs: Arc<dyn RunStore>,
        executor: Arc<AutomationExecutor>,
    ) -> Self {
        Self {
            automations,
            runs,
            executor,
        }
    }

    pub async fn fire_trigger(
        &self,
        trigger_type: TriggerType,
        payload: Value,
        scope: &DispatchScope,
    ) -> EngineResult<DispatchReport> {
        let candidates = self.automations.list_active(trigger_type, scope.tenant_id).await?;

        let mut outcomes = Vec::new();
        let mut tasks = Vec::new();

        for automation in candidates.iter().filter(|a| matches_filters(a, &payload, scope)) {
            match self.start_run(automation, trigger_type, payload.clone()).await {
                Ok((run_id, handle)) => {
                    outcomes.push(DispatchOutcome {
                        automation_id: automation.id,
                        run_id: Some(run_id),
                        error: None,
                    });
                    tasks.push((run_id, handle));
                }
                Err(e) => {
                    warn!("Could not start automation {} for {}: {}", automation.id, trigger_type, e);
                    outcomes.push(DispatchOutcome {
                        automation_id: automation.id,
                        run_id: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        info!(
            "Trigger {} matched {} of {} active automation(s), {} run(s) started",
            trigger_type,
            outcomes.len(),
            candidates.len(),
            tasks.len()
        );

        Ok(DispatchReport {
            outcomes,
            completion: supervise(tasks),
        })
    }

    /// Creates a `pending` run for `automation` and hands it to the executor on its own task.
    pub async fn start_run(
        &self,
        automation: &Automation,
        trigger_type: TriggerType,
        payload: Value,
    ) -> EngineResult<RunTask> {
        let run = AutomationRun::pending(automation, trigger_type, payload);
        self.runs.insert(&run).await?;

        debug!("Created run {} for automation {}", run.id, automation.id);

        let executor = self.executor.clone();
        let run_id = run.id;
        let handle = tokio::spawn(async move { executor.execute_run(run_id).await });

        Ok((run_id, handle))
    }
}

#[async_trait]
impl TriggerSink for TriggerDispatcher {
    async fn fire(
        &self,
        trigger_type: TriggerType,
        payload: Value,
        scope: DispatchScope,
    ) -> EngineResult<Vec<DispatchOutcome>> {
        Ok(self.fire_trigger(trigger_type, payload, &scope).await?.outcomes)
    }
}

/// Whether `automation`'s trigger config lets this event through.
pub fn matches_filters(automation: &Automation, payload: &Value, scope: &DispatchScope) -> bool {
    if scope.automation_id.is_some_and(|id| id != automation.id) {
        return false;
    }

    let config = &automation.trigger_config;

    if let (Some(wanted), Some(configured)) = (&scope.site_id, &config.site_id) {
        if wanted != configured {
            return false;
        }
    }

    if let Some(expected) = &config.status {
        let actual = payload.get("status").and_then(Value::as_str);
        if actual != Some(expected.as_str()) {
            return false;
        }
    }

    true
}

/// Awaits every run task and logs how each one ended.
pub fn supervise(tasks: Vec<RunTask>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (ids, handles): (Vec<Uuid>, Vec<_>) = tasks.into_iter().unzip();
        let results = join_all(handles).await;

        for (run_id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(Ok(status)) => debug!("Run {} settled as {}", run_id, status),
                Ok(Err(e)) => error!("Run {} errored: {}", run_id, e),
                Err(e) => error!("Run {} task panicked or was aborted: {}", run_id, e),
            }
        }
    })
}
