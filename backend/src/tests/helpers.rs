use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kontor_shared::{Automation, AutomationRun, RunStatus, TriggerType};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::jobs::order_poller::{PollAudit, PollerStateStore};
use crate::jobs::JobResult;
use crate::services::email::MockEmailSender;
use crate::services::tenant_settings::MockTenantSettingsProvider;
use crate::workflows::store::memory::{InMemoryAutomationStore, InMemoryRunStore};
use crate::workflows::store::AutomationStore;
use crate::workflows::webhook::WebhookClient;
use crate::workflows::{ActionRegistry, AutomationEngine};

static LOGGING: Once = Once::new();

pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("kontor_backend=debug")
            .with_test_writer()
            .try_init();
    });
}

/// Webhook settings that let tests talk to a local wiremock server.
pub fn local_webhook_config() -> WebhookConfig {
    WebhookConfig {
        timeout_secs: 2,
        allowed_hosts: vec!["127.0.0.1".to_string()],
    }
}

/// An engine wired to in-memory stores and mocked collaborators.
pub struct EngineHarness {
    pub automations: Arc<InMemoryAutomationStore>,
    pub runs: Arc<InMemoryRunStore>,
    pub engine: Arc<AutomationEngine>,
}

impl EngineHarness {
    pub fn new() -> Self {
        Self::with_collaborators(
            MockEmailSender::new(),
            MockTenantSettingsProvider::new(),
            local_webhook_config(),
        )
    }

    pub fn with_email(email: MockEmailSender, settings: MockTenantSettingsProvider) -> Self {
        Self::with_collaborators(email, settings, local_webhook_config())
    }

    pub fn with_collaborators(
        email: MockEmailSender,
        settings: MockTenantSettingsProvider,
        webhook: WebhookConfig,
    ) -> Self {
        init_test_logging();

        let automations = Arc::new(InMemoryAutomationStore::new());
        let runs = Arc::new(InMemoryRunStore::new());
        let actions = ActionRegistry::new(Arc::new(email), Arc::new(settings), WebhookClient::new(&webhook));
        let engine = Arc::new(AutomationEngine::new(automations.clone(), runs.clone(), actions));

        Self {
            automations,
            runs,
            engine,
        }
    }

    pub async fn add(&self, automation: Automation) -> Automation {
        self.automations.insert(automation.clone()).await;
        automation
    }

    pub async fn automation(&self, id: Uuid) -> Automation {
        self.automations
            .get(id)
            .await
            .expect("store should not fail")
            .expect("automation should exist")
    }

    /// Starts a run and waits for the executor to put it down.
    pub async fn run_once(&self, automation: &Automation, payload: Value) -> (RunStatus, AutomationRun) {
        let (run_id, handle) = self
            .engine
            .dispatcher()
            .start_run(automation, automation.trigger_type, payload)
            .await
            .expect("run should be created");

        let status = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("run should settle")
            .expect("run task should not panic")
            .expect("run should not hit a store error");

        (status, self.engine.get_run(run_id).await.expect("run should exist"))
    }

    /// Polls until the run leaves `pending`/`running`.
    pub async fn settled_run(&self, run_id: Uuid) -> AutomationRun {
        for _ in 0..200 {
            let run = self.engine.get_run(run_id).await.expect("run should exist");
            if !matches!(run.status, RunStatus::Pending | RunStatus::Running) {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("run {} did not settle", run_id);
    }
}

pub fn executed_nodes(run: &AutomationRun) -> Vec<&str> {
    run.execution_log.iter().map(|e| e.node_id.as_str()).collect()
}

/// Poller bookkeeping kept in memory.
#[derive(Default)]
pub struct InMemoryPollerState {
    pub checkpoints: Mutex<HashMap<Uuid, DateTime<Utc>>>,
    pub processed: Mutex<HashSet<(Uuid, String, TriggerType)>>,
    pub audits: Mutex<Vec<PollAudit>>,
}

#[async_trait]
impl PollerStateStore for InMemoryPollerState {
    async fn checkpoint(&self, tenant_id: Uuid) -> JobResult<Option<DateTime<Utc>>> {
        Ok(self.checkpoints.lock().await.get(&tenant_id).copied())
    }

    async fn save_checkpoint(&self, tenant_id: Uuid, checkpoint: DateTime<Utc>, _polled_at: DateTime<Utc>) -> JobResult<()> {
        let mut checkpoints = self.checkpoints.lock().await;
        let entry = checkpoints.entry(tenant_id).or_insert(checkpoint);
        if checkpoint > *entry {
            *entry = checkpoint;
        }
        Ok(())
    }

    async fn is_processed(&self, tenant_id: Uuid, external_id: &str, trigger_type: TriggerType) -> JobResult<bool> {
        Ok(self
            .processed
            .lock()
            .await
            .contains(&(tenant_id, external_id.to_string(), trigger_type)))
    }

    async fn mark_processed(&self, tenant_id: Uuid, external_id: &str, trigger_type: TriggerType) -> JobResult<()> {
        self.processed
            .lock()
            .await
            .insert((tenant_id, external_id.to_string(), trigger_type));
        Ok(())
    }

    async fn record_audit(&self, audit: &PollAudit) -> JobResult<()> {
        self.audits.lock().await.push(audit.clone());
        Ok(())
    }
}
