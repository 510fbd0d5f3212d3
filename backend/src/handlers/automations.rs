use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use kontor_shared::{Automation, AutomationRun, DispatchOutcome, DispatchScope, TriggerType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::jobs::scheduler::ScheduledTrigger;
use crate::AppState;

const DEFAULT_RUN_LIMIT: i64 = 20;
const MAX_RUN_LIMIT: i64 = 100;

pub fn automation_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(super::health_check))
        .route("/events", post(ingest_event))
        .route("/jobs", get(job_status))
        .route("/runs/:run_id", get(get_run))
        .route("/runs/:run_id/retry", post(retry_run))
        .route("/runs/:run_id/cancel", post(cancel_run))
        .route("/:id/activate", post(activate_automation))
        .route("/:id/deactivate", post(deactivate_automation))
        .route("/:id/trigger", post(trigger_automation))
        .route("/:id/runs", get(list_runs))
}

#[derive(Debug, Deserialize)]
pub struct RunQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
    pub trigger_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub scope: Option<DispatchScope>,
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub outcomes: Vec<DispatchOutcome>,
}

async fn activate_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Automation>> {
    Ok(Json(state.engine.activate(id).await?))
}

async fn deactivate_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.engine.deactivate(id).await?;
    Ok(Json(json!({ "id": id, "active": false })))
}

async fn trigger_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Option<Json<Value>>,
) -> ApiResult<(StatusCode, Json<DispatchOutcome>)> {
    let payload = body.map(|Json(v)| v).unwrap_or_else(|| json!({}));
    let outcome = state.engine.trigger_manual(id, payload).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<RunQuery>,
) -> ApiResult<Json<Vec<AutomationRun>>> {
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    Ok(Json(state.engine.list_runs(id, limit).await?))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<AutomationRun>> {
    Ok(Json(state.engine.get_run(run_id).await?))
}

async fn retry_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<DispatchOutcome>)> {
    let outcome = state.engine.retry_run(run_id).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<AutomationRun>> {
    Ok(Json(state.engine.cancel_run(run_id).await?))
}

/// Live cron triggers and the most recent background job passes.
async fn job_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let scheduled: HashMap<String, ScheduledTrigger> = state
        .scheduler
        .scheduled_triggers()
        .await
        .into_iter()
        .map(|(automation_id, trigger)| (automation_id.to_string(), trigger))
        .collect();

    Json(json!({
        "scheduled": scheduled,
        "executions": state.scheduler.get_execution_logs().await,
    }))
}

async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EventRequest>,
) -> ApiResult<(StatusCode, Json<EventResponse>)> {
    let trigger_type = request
        .trigger_type
        .parse::<TriggerType>()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let scope = request.scope.unwrap_or_default();
    let report = state.engine.fire(trigger_type, request.payload, &scope).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EventResponse {
            outcomes: report.outcomes,
        }),
    ))
}
