use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::error::AppError;

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Tenant the request acts on, taken from the `X-Tenant-Id` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantContext(pub Uuid);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for TenantContext {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|header| header.to_str().ok())
            .ok_or_else(|| AppError::BadRequest("Missing X-Tenant-Id header".to_string()).into_response())?;

        Uuid::parse_str(value.trim())
            .map(TenantContext)
            .map_err(|_| AppError::BadRequest("X-Tenant-Id must be a UUID".to_string()).into_response())
    }
}
