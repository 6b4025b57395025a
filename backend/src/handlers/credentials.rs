use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::error::{ApiResult, AppError, ValidationBuilder};
use crate::tenant::TenantContext;
use crate::validation::{finish, validate_payload};
use crate::AppState;
use flowops_shared::{logical_key, CredentialMapping, LogicalCredential};

use super::environments::load_environment;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateLogicalCredentialRequest {
    /// Defaults to `"<required_type>:<name>"`
    pub key: Option<String>,
    #[validate(length(min = 1, max = 200, message = "Name must be 1-200 characters"))]
    pub name: String,
    #[validate(length(min = 1, max = 200, message = "Required type must be 1-200 characters"))]
    pub required_type: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpsertMappingRequest {
    #[validate(length(min = 1, message = "Logical key is required"))]
    pub logical_key: String,
    #[validate(length(min = 1, message = "Physical credential id is required"))]
    pub physical_credential_id: String,
    #[validate(length(min = 1, message = "Physical name is required"))]
    pub physical_name: String,
    #[validate(length(min = 1, message = "Physical type is required"))]
    pub physical_type: String,
}

pub fn credential_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/logical", get(list_logical_credentials).post(create_logical_credential))
        .route(
            "/environments/:environment_id/mappings",
            get(list_mappings).put(upsert_mapping),
        )
        .route("/mappings/:id", delete(delete_mapping))
}

async fn list_logical_credentials(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
) -> ApiResult<Json<Vec<LogicalCredential>>> {
    Ok(Json(state.credentials.list_logical_credentials(tenant_id).await?))
}

async fn create_logical_credential(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Json(payload): Json<CreateLogicalCredentialRequest>,
) -> ApiResult<(StatusCode, Json<LogicalCredential>)> {
    validate_payload(&payload)?;

    let required_type = payload.required_type.trim().to_string();
    let name = payload.name.trim().to_string();
    let key = payload
        .key
        .map(|k| k.trim().to_string())
        .unwrap_or_else(|| logical_key(&required_type, &name));
    finish(ValidationBuilder::new().error_if(
        !key.starts_with(&format!("{}:", required_type)) || key.len() <= required_type.len() + 1,
        "key",
        "Key must be '<required_type>:<name>'",
    ))?;

    let credential = LogicalCredential {
        id: Uuid::new_v4(),
        tenant_id,
        key,
        name,
        required_type,
        description: payload.description,
        created_at: Utc::now(),
    };
    state.credentials.create_logical_credential(&credential).await?;

    Ok((StatusCode::CREATED, Json(credential)))
}

async fn list_mappings(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Path(environment_id): Path<Uuid>,
) -> ApiResult<Json<Vec<CredentialMapping>>> {
    load_environment(&state, tenant_id, environment_id).await?;
    Ok(Json(state.credentials.list_mappings(tenant_id, environment_id).await?))
}

async fn upsert_mapping(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Path(environment_id): Path<Uuid>,
    Json(payload): Json<UpsertMappingRequest>,
) -> ApiResult<Json<CredentialMapping>> {
    validate_payload(&payload)?;
    load_environment(&state, tenant_id, environment_id).await?;

    let logical = state
        .credentials
        .find_logical_credential(tenant_id, payload.logical_key.trim())
        .await?
        .ok_or_else(|| AppError::NotFound("Logical credential".to_string()))?;

    // A physical credential stands for exactly one logical credential per environment
    if let Some(other) = state
        .credentials
        .find_mapping_by_physical(environment_id, &payload.physical_type, &payload.physical_credential_id)
        .await?
    {
        if other.logical_credential_id != logical.id {
            return Err(AppError::Conflict(format!(
                "Credential '{}' is already mapped to another logical credential in this environment",
                payload.physical_credential_id
            )));
        }
    }

    let existing = state
        .credentials
        .get_mapping(tenant_id, logical.id, environment_id)
        .await?;
    let now = Utc::now();
    let mapping = CredentialMapping {
        id: existing.as_ref().map(|m| m.id).unwrap_or_else(Uuid::new_v4),
        tenant_id,
        logical_credential_id: logical.id,
        environment_id,
        physical_credential_id: payload.physical_credential_id,
        physical_name: payload.physical_name,
        physical_type: payload.physical_type,
        created_at: existing.map(|m| m.created_at).unwrap_or(now),
        updated_at: Some(now),
    };

    let saved = state.credentials.upsert_mapping(&mapping).await?;
    tracing::info!(
        "Mapped {} to '{}' in environment {}",
        logical.key,
        saved.physical_name,
        environment_id
    );
    Ok(Json(saved))
}

async fn delete_mapping(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if state.credentials.delete_mapping(tenant_id, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Credential mapping".to_string()))
    }
}
