//! Tenant extraction for Axum.
//!
//! Requests arrive through an authenticating proxy that sets
//! `X-Organization-Id` and, for user-initiated calls, `X-User-Id`.

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use dealflow_core::{OrganizationId, UserId};
use serde_json::json;
use std::str::FromStr;

pub const ORGANIZATION_HEADER: &str = "x-organization-id";
pub const USER_HEADER: &str = "x-user-id";

/// The organization (and optionally the user) a request acts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tenant {
    pub organization_id: OrganizationId,
    pub user_id: Option<UserId>,
}

impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = TenantRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let organization_id = header_id(&parts.headers, ORGANIZATION_HEADER)?
            .ok_or(TenantRejection::MissingOrganization)?;
        let user_id = header_id(&parts.headers, USER_HEADER)?;

        Ok(Tenant {
            organization_id,
            user_id,
        })
    }
}

fn header_id<T: FromStr>(headers: &HeaderMap, name: &'static str) -> Result<Option<T>, TenantRejection> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|raw| T::from_str(raw.trim()).ok())
        .map(Some)
        .ok_or(TenantRejection::InvalidHeader { name })
}

/// Rejection type for the tenant extractor.
#[derive(Debug, PartialEq, Eq)]
pub enum TenantRejection {
    MissingOrganization,
    InvalidHeader { name: &'static str },
}

impl IntoResponse for TenantRejection {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::MissingOrganization => (StatusCode::UNAUTHORIZED, "Missing organization".to_string()),
            Self::InvalidHeader { name } => (StatusCode::BAD_REQUEST, format!("Invalid {name} header")),
        };
        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}
