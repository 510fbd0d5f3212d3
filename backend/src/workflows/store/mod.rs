// Automation and run persistence
//
// Status transitions are compare-and-swap updates on the expected prior
// status, so a run is only ever advanced by the invocation that owns it.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kontor_shared::{Automation, AutomationRun, ExecutionLogEntry, RunContext, RunStatus, TriggerType};
use thiserror::Error;
use uuid::Uuid;

pub use postgres::{PgAutomationStore, PgRunStore};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Terminal state of a run, folded into the automation's stats.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// A run taken out of `waiting` together with the wait node it was parked on.
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    pub run: AutomationRun,
    pub wait_node_id: Option<String>,
}

#[async_trait]
pub trait AutomationStore: Send + Sync {
    async fn get(&self, id: Uuid) -> StoreResult<Option<Automation>>;

    /// Active automations listening for `trigger_type`, optionally limited to one tenant.
    async fn list_active(&self, trigger_type: TriggerType, tenant_id: Option<Uuid>) -> StoreResult<Vec<Automation>>;

    async fn set_active(&self, id: Uuid, active: bool) -> StoreResult<bool>;

    /// Atomic counter increment; never rewrites the whole record.
    async fn record_outcome(&self, id: Uuid, outcome: &RunOutcome) -> StoreResult<()>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert(&self, run: &AutomationRun) -> StoreResult<()>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<AutomationRun>>;

    async fn status(&self, id: Uuid) -> StoreResult<Option<RunStatus>>;

    /// `pending -> running`
    async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> StoreResult<bool>;

    /// Appends one log entry and stores the context as of that node. Only applies while `running`.
    async fn record_step(&self, id: Uuid, entry: &ExecutionLogEntry, context: &RunContext) -> StoreResult<()>;

    /// `running -> waiting`
    async fn suspend(&self, id: Uuid, node_id: &str, resume_at: DateTime<Utc>) -> StoreResult<bool>;

    /// `running -> completed | failed | cancelled`
    async fn finish(
        &self,
        id: Uuid,
        status: RunStatus,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// `waiting -> running`, clearing the resume position. `None` when another caller won.
    async fn claim_waiting(&self, id: Uuid) -> StoreResult<Option<ClaimedRun>>;

    /// Any non-terminal status -> `cancelled`. Returns the status the run was cancelled from.
    async fn cancel(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<Option<RunStatus>>;

    async fn list_due(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Uuid>>;

    async fn list_for_automation(&self, automation_id: Uuid, limit: i64) -> StoreResult<Vec<AutomationRun>>;
}
