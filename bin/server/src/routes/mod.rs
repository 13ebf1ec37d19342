//! HTTP routes.
//!
//! Every `/api` route is scoped to the [`Tenant`](crate::tenant::Tenant)
//! named by the request headers.

mod crm;
mod events;
mod executions;
mod workflows;

#[cfg(test)]
mod test_support;

use crate::error::ApiError;
use crate::state::AppState;
use axum::Json;
use axum::Router;
use axum::routing::{get, post, put};
use serde_json::{Value as JsonValue, json};
use std::str::FromStr;

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/workflows",
            get(workflows::list).post(workflows::create),
        )
        .route(
            "/api/workflows/{id}",
            get(workflows::get)
                .put(workflows::update)
                .delete(workflows::delete),
        )
        .route("/api/workflows/{id}/active", post(workflows::set_active))
        .route("/api/workflows/{id}/steps", put(workflows::replace_steps))
        .route("/api/workflows/{id}/execute", post(workflows::execute))
        .route("/api/executions", get(executions::list))
        .route("/api/executions/{id}", get(executions::get))
        .route("/api/executions/{id}/cancel", post(executions::cancel))
        .route("/api/events", post(events::ingest))
        .route("/api/deals", post(crm::create_deal))
        .route("/api/deals/{id}/stage", post(crm::move_deal))
        .route(
            "/api/activities/{id}/complete",
            post(crm::complete_activity),
        )
        .route("/api/notifications", get(crm::list_notifications))
        .with_state(state)
}

async fn health() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

/// Parses an id taken from a path or query string.
fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, ApiError> {
    T::from_str(raw).map_err(|_| ApiError::bad_request(format!("Invalid {what} ID")))
}
