//! HTTP error responses.
//!
//! Domain errors are converted to a status code and a user-safe message.
//! Details of internal failures are logged, never returned to the caller.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dealflow_scheduler::{DispatchError, QueueError};
use dealflow_workflow::StoreError;
use rootcause::prelude::Report;
use serde_json::json;
use std::fmt;

/// An error returned by an API handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unavailable() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service temporarily unavailable",
        )
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<&DispatchError> for ApiError {
    fn from(error: &DispatchError) -> Self {
        match error {
            DispatchError::WorkflowNotFound { .. } => Self::not_found("Workflow not found"),
            DispatchError::ExecutionNotFound { .. } => Self::not_found("Execution not found"),
            DispatchError::WorkflowInactive { .. } => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Workflow is inactive",
            ),
            DispatchError::Validation(e) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            DispatchError::Transition(_) => {
                Self::new(StatusCode::CONFLICT, "Execution has already finished")
            }
            DispatchError::Store(e) => Self::from(e),
            DispatchError::Queue(e) => Self::from(e),
        }
    }
}

impl From<Report<DispatchError>> for ApiError {
    fn from(report: Report<DispatchError>) -> Self {
        let error = Self::from(report.current_context());
        if error.status.is_server_error() {
            tracing::error!(error = %report, "request failed");
        } else {
            tracing::debug!(error = %report, "request rejected");
        }
        error
    }
}

impl From<&StoreError> for ApiError {
    fn from(error: &StoreError) -> Self {
        match error {
            StoreError::NotFound { .. } => Self::not_found("Not found"),
            StoreError::Conflict { .. } => Self::new(StatusCode::CONFLICT, "Conflicting update"),
            StoreError::Unavailable { .. } => Self::unavailable(),
            StoreError::Corrupt { .. } | StoreError::Backend { .. } => Self::internal(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        let api = Self::from(&error);
        if api.status.is_server_error() {
            tracing::error!(error = %error, "storage failure");
        }
        api
    }
}

impl From<&QueueError> for ApiError {
    fn from(error: &QueueError) -> Self {
        if error.is_transient() {
            Self::unavailable()
        } else {
            Self::internal()
        }
    }
}
