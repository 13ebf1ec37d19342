//! Domain event ingestion.

use crate::error::ApiError;
use crate::state::AppState;
use crate::tenant::Tenant;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use dealflow_core::ExecutionId;
use dealflow_workflow::TriggerEvent;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub executions: Vec<ExecutionId>,
}

/// Accepts an event from the CRM and queues every matching workflow.
pub async fn ingest(
    State(state): State<AppState>,
    tenant: Tenant,
    Json(mut event): Json<TriggerEvent>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    if event.actor.is_none() {
        event.actor = tenant.user_id;
    }
    let executions = state
        .dispatcher
        .enqueue_matches(tenant.organization_id, &event)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { executions })))
}
