//! Execution history and cancellation routes.

use super::parse_id;
use crate::error::ApiError;
use crate::state::AppState;
use crate::tenant::Tenant;
use axum::Json;
use axum::extract::{Path, Query, State};
use dealflow_core::{ExecutionId, WorkflowId};
use dealflow_workflow::{ExecutionDetail, ExecutionHandle, WorkflowExecution};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub workflow_id: Option<String>,
    pub limit: Option<u32>,
}

pub async fn list(
    State(state): State<AppState>,
    tenant: Tenant,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<WorkflowExecution>>, ApiError> {
    let workflow_id = params
        .workflow_id
        .as_deref()
        .map(|raw| parse_id::<WorkflowId>(raw, "workflow"))
        .transpose()?;
    let executions = state
        .dispatcher
        .get_executions(tenant.organization_id, workflow_id, params.limit)
        .await?;
    Ok(Json(executions))
}

pub async fn get(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<String>,
) -> Result<Json<ExecutionDetail>, ApiError> {
    let execution_id: ExecutionId = parse_id(&id, "execution")?;
    let detail = state
        .dispatcher
        .get_execution(tenant.organization_id, execution_id)
        .await?;
    Ok(Json(detail))
}

pub async fn cancel(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<String>,
) -> Result<Json<ExecutionHandle>, ApiError> {
    let execution_id: ExecutionId = parse_id(&id, "execution")?;
    let handle = state
        .dispatcher
        .cancel_execution(tenant.organization_id, execution_id)
        .await?;
    Ok(Json(handle))
}
