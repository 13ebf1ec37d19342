//! Workflow definition routes.

use super::parse_id;
use crate::error::ApiError;
use crate::state::AppState;
use crate::tenant::Tenant;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use dealflow_core::WorkflowId;
use dealflow_workflow::{
    ExecutionHandle, StepDraft, StepSequence, TriggerPayload, WorkflowDefinition, WorkflowDetail,
    WorkflowDraft,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct StepsRequest {
    pub steps: Vec<StepDraft>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub payload: TriggerPayload,
}

pub async fn list(
    State(state): State<AppState>,
    tenant: Tenant,
) -> Result<Json<Vec<WorkflowDefinition>>, ApiError> {
    let workflows = state
        .dispatcher
        .list_workflows(tenant.organization_id)
        .await?;
    Ok(Json(workflows))
}

pub async fn create(
    State(state): State<AppState>,
    tenant: Tenant,
    Json(draft): Json<WorkflowDraft>,
) -> Result<(StatusCode, Json<WorkflowDetail>), ApiError> {
    let detail = state
        .dispatcher
        .create_workflow(tenant.organization_id, tenant.user_id, draft)
        .await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn get(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<String>,
) -> Result<Json<WorkflowDetail>, ApiError> {
    let workflow_id: WorkflowId = parse_id(&id, "workflow")?;
    let detail = state
        .dispatcher
        .get_workflow(tenant.organization_id, workflow_id)
        .await?;
    Ok(Json(detail))
}

pub async fn update(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<String>,
    Json(draft): Json<WorkflowDraft>,
) -> Result<Json<WorkflowDetail>, ApiError> {
    let workflow_id: WorkflowId = parse_id(&id, "workflow")?;
    let detail = state
        .dispatcher
        .update_workflow(tenant.organization_id, workflow_id, draft)
        .await?;
    Ok(Json(detail))
}

pub async fn delete(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let workflow_id: WorkflowId = parse_id(&id, "workflow")?;
    state
        .dispatcher
        .delete_workflow(tenant.organization_id, workflow_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_active(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<String>,
    Json(request): Json<ActiveRequest>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    let workflow_id: WorkflowId = parse_id(&id, "workflow")?;
    let definition = state
        .dispatcher
        .set_active(tenant.organization_id, workflow_id, request.active)
        .await?;
    Ok(Json(definition))
}

pub async fn replace_steps(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<String>,
    Json(request): Json<StepsRequest>,
) -> Result<Json<StepSequence>, ApiError> {
    let workflow_id: WorkflowId = parse_id(&id, "workflow")?;
    let steps = state
        .dispatcher
        .replace_steps(tenant.organization_id, workflow_id, request.steps)
        .await?;
    Ok(Json(steps))
}

pub async fn execute(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<String>,
    request: Option<Json<ExecuteRequest>>,
) -> Result<(StatusCode, Json<ExecutionHandle>), ApiError> {
    let workflow_id: WorkflowId = parse_id(&id, "workflow")?;
    let payload = request
        .map(|Json(request)| request.payload)
        .unwrap_or_default();
    let handle = state
        .dispatcher
        .execute_workflow(
            tenant.organization_id,
            workflow_id,
            payload,
            tenant.user_id,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(handle)))
}
