use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kontor_shared::{
    Automation, AutomationNode, AutomationRun, AutomationStats, ExecutionLogEntry, RunContext, RunStatus,
    TriggerConfig, TriggerType,
};
use sqlx::{types::Json, FromRow, PgPool};
use uuid::Uuid;

use super::{AutomationStore, ClaimedRun, RunOutcome, RunStore, StoreError, StoreResult};

#[derive(Debug, FromRow)]
struct AutomationRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    active: bool,
    trigger_type: String,
    trigger_config: Json<TriggerConfig>,
    nodes: Json<Vec<AutomationNode>>,
    total_runs: i64,
    successful_runs: i64,
    failed_runs: i64,
    last_run_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<AutomationRow> for Automation {
    type Error = StoreError;

    fn try_from(row: AutomationRow) -> Result<Self, Self::Error> {
        let trigger_type = row.trigger_type.parse::<TriggerType>().map_err(|e| StoreError::Corrupt {
            id: row.id,
            reason: e.to_string(),
        })?;

        Ok(Automation {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            active: row.active,
            trigger_type,
            trigger_config: row.trigger_config.0,
            nodes: row.nodes.0,
            stats: AutomationStats {
                total_runs: row.total_runs,
                successful_runs: row.successful_runs,
                failed_runs: row.failed_runs,
                last_run_at: row.last_run_at,
                last_error: row.last_error,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const AUTOMATION_COLUMNS: &str = "id, tenant_id, name, active, trigger_type, trigger_config, nodes, \
     total_runs, successful_runs, failed_runs, last_run_at, last_error, created_at, updated_at";

pub struct PgAutomationStore {
    db_pool: PgPool,
}

impl PgAutomationStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    #[cfg(test)]
    pub async fn insert(&self, automation: &Automation) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO automations
            (id, tenant_id, name, active, trigger_type, trigger_config, nodes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(automation.id)
        .bind(automation.tenant_id)
        .bind(&automation.name)
        .bind(automation.active)
        .bind(automation.trigger_type.as_str())
        .bind(Json(&automation.trigger_config))
        .bind(Json(&automation.nodes))
        .bind(automation.created_at)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl AutomationStore for PgAutomationStore {
    async fn get(&self, id: Uuid) -> StoreResult<Option<Automation>> {
        let row = sqlx::query_as::<_, AutomationRow>(&format!(
            "SELECT {} FROM automations WHERE id = $1",
            AUTOMATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db_pool)
        .await?;

        row.map(Automation::try_from).transpose()
    }

    async fn list_active(&self, trigger_type: TriggerType, tenant_id: Option<Uuid>) -> StoreResult<Vec<Automation>> {
        let rows = sqlx::query_as::<_, AutomationRow>(&format!(
            r#"
            SELECT {} FROM automations
            WHERE active = TRUE
              AND trigger_type = $1
              AND ($2::uuid IS NULL OR tenant_id = $2)
            ORDER BY created_at ASC
            "#,
            AUTOMATION_COLUMNS
        ))
        .bind(trigger_type.as_str())
        .bind(tenant_id)
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter().map(Automation::try_from).collect()
    }

    async fn set_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE automations SET active = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.db_pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_outcome(&self, id: Uuid, outcome: &RunOutcome) -> StoreResult<()> {
        let (succeeded, failed) = match outcome.status {
            RunStatus::Completed => (1_i64, 0_i64),
            RunStatus::Failed => (0, 1),
            _ => (0, 0),
        };

        sqlx::query(
            r#"
            UPDATE automations
            SET total_runs = total_runs + 1,
                successful_runs = successful_runs + $2,
                failed_runs = failed_runs + $3,
                last_run_at = $4,
                last_error = CASE WHEN $3 > 0 THEN $5 ELSE last_error END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(succeeded)
        .bind(failed)
        .bind(outcome.finished_at)
        .bind(outcome.error.as_deref())
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct RunRow {
    id: Uuid,
    automation_id: Uuid,
    automation_name: String,
    tenant_id: Uuid,
    trigger_type: String,
    trigger_data: serde_json::Value,
    status: RunStatus,
    current_node_id: Option<String>,
    scheduled_at: Option<DateTime<Utc>>,
    context: Json<RunContext>,
    execution_log: Json<Vec<ExecutionLogEntry>>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for AutomationRun {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let trigger_type = row.trigger_type.parse::<TriggerType>().map_err(|e| StoreError::Corrupt {
            id: row.id,
            reason: e.to_string(),
        })?;

        Ok(AutomationRun {
            id: row.id,
            automation_id: row.automation_id,
            automation_name: row.automation_name,
            tenant_id: row.tenant_id,
            trigger_type,
            trigger_data: row.trigger_data,
            status: row.status,
            current_node_id: row.current_node_id,
            scheduled_at: row.scheduled_at,
            context: row.context.0,
            execution_log: row.execution_log.0,
            error: row.error,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
        })
    }
}

const RUN_COLUMNS: &str = "id, automation_id, automation_name, tenant_id, trigger_type, trigger_data, status, \
     current_node_id, scheduled_at, context, execution_log, error, started_at, completed_at, created_at";

pub struct PgRunStore {
    db_pool: PgPool,
}

impl PgRunStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn insert(&self, run: &AutomationRun) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO automation_runs
            (id, automation_id, automation_name, tenant_id, trigger_type, trigger_data, status,
             context, execution_log, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, '[]'::jsonb, $9)
            "#,
        )
        .bind(run.id)
        .bind(run.automation_id)
        .bind(&run.automation_name)
        .bind(run.tenant_id)
        .bind(run.trigger_type.as_str())
        .bind(&run.trigger_data)
        .bind(run.status)
        .bind(Json(&run.context))
        .bind(run.created_at)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<AutomationRun>> {
        let row = sqlx::query_as::<_, RunRow>(&format!("SELECT {} FROM automation_runs WHERE id = $1", RUN_COLUMNS))
            .bind(id)
            .fetch_optional(&self.db_pool)
            .await?;

        row.map(AutomationRun::try_from).transpose()
    }

    async fn status(&self, id: Uuid) -> StoreResult<Option<RunStatus>> {
        let status: Option<(RunStatus,)> = sqlx::query_as("SELECT status FROM automation_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db_pool)
            .await?;

        Ok(status.map(|(s,)| s))
    }

    async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE automation_runs SET status = 'running', started_at = $2 WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(started_at)
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_step(&self, id: Uuid, entry: &ExecutionLogEntry, context: &RunContext) -> StoreResult<()> {
        let entry = serde_json::to_value(entry)?;

        sqlx::query(
            r#"
            UPDATE automation_runs
            SET execution_log = execution_log || jsonb_build_array($2::jsonb),
                context = $3
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(entry)
        .bind(Json(context))
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn suspend(&self, id: Uuid, node_id: &str, resume_at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE automation_runs
            SET status = 'waiting', current_node_id = $2, scheduled_at = $3
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(node_id)
        .bind(resume_at)
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish(
        &self,
        id: Uuid,
        status: RunStatus,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE automation_runs
            SET status = $2, error = $3, completed_at = $4, current_node_id = NULL, scheduled_at = NULL
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .bind(completed_at)
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_waiting(&self, id: Uuid) -> StoreResult<Option<ClaimedRun>> {
        // `prev` is read from the pre-update snapshot, so it still holds the wait node
        let claimed: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            UPDATE automation_runs AS r
            SET status = 'running', current_node_id = NULL, scheduled_at = NULL
            FROM automation_runs AS prev
            WHERE r.id = $1 AND prev.id = r.id AND r.status = 'waiting'
            RETURNING prev.current_node_id
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db_pool)
        .await?;

        let Some((wait_node_id,)) = claimed else {
            return Ok(None);
        };

        let run = self.get(id).await?.ok_or_else(|| StoreError::Corrupt {
            id,
            reason: "claimed run disappeared".to_string(),
        })?;

        Ok(Some(ClaimedRun { run, wait_node_id }))
    }

    async fn cancel(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<Option<RunStatus>> {
        let previous: Option<(RunStatus,)> = sqlx::query_as(
            r#"
            UPDATE automation_runs AS r
            SET status = 'cancelled', completed_at = $2, current_node_id = NULL, scheduled_at = NULL
            FROM automation_runs AS prev
            WHERE r.id = $1 AND prev.id = r.id AND r.status IN ('pending', 'running', 'waiting')
            RETURNING prev.status
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(previous.map(|(status,)| status))
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM automation_runs
            WHERE status = 'waiting' AND scheduled_at <= $1
            ORDER BY scheduled_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn list_for_automation(&self, automation_id: Uuid, limit: i64) -> StoreResult<Vec<AutomationRun>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM automation_runs WHERE automation_id = $1 ORDER BY created_at DESC LIMIT $2",
            RUN_COLUMNS
        ))
        .bind(automation_id)
        .bind(limit)
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter().map(AutomationRun::try_from).collect()
    }
}
