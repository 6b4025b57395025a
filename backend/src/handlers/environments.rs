use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::error::{ApiResult, AppError, ValidationBuilder};
use crate::tenant::TenantContext;
use crate::validation::{finish, is_http_url, is_repository_name, validate_payload};
use crate::AppState;
use flowops_shared::{Environment, EnvironmentClass, GitTarget};

use super::drift;

#[derive(Debug, Deserialize, Validate)]
pub struct GitTargetRequest {
    pub repository: String,
    #[validate(length(min = 1, max = 255, message = "Branch must be 1-255 characters"))]
    pub branch: Option<String>,
    pub path_prefix: Option<String>,
    #[validate(length(min = 1, message = "Token is required"))]
    pub token: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateEnvironmentRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: String,
    pub class: EnvironmentClass,
    pub runtime_base_url: String,
    #[validate(length(min = 1, message = "Runtime API key is required"))]
    pub runtime_api_key: String,
    #[validate(nested)]
    pub git: Option<GitTargetRequest>,
}

pub fn environment_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_environments).post(create_environment))
        .route("/:id", get(get_environment).delete(delete_environment))
        .merge(drift::drift_routes())
}

pub(crate) async fn load_environment(
    state: &AppState,
    tenant_id: Uuid,
    id: Uuid,
) -> ApiResult<Environment> {
    state
        .repo
        .get_environment(tenant_id, id)
        .await?
        .ok_or_else(|| AppError::NotFound("Environment".to_string()))
}

async fn list_environments(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
) -> ApiResult<Json<Vec<Environment>>> {
    Ok(Json(state.repo.list_environments(tenant_id).await?))
}

async fn create_environment(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Json(payload): Json<CreateEnvironmentRequest>,
) -> ApiResult<(StatusCode, Json<Environment>)> {
    validate_payload(&payload)?;

    let mut checks = ValidationBuilder::new().error_if(
        !is_http_url(&payload.runtime_base_url),
        "runtime_base_url",
        "Runtime base URL must be an absolute http(s) URL",
    );
    if let Some(git) = &payload.git {
        checks = checks.error_if(
            !is_repository_name(&git.repository),
            "git.repository",
            "Repository must be in owner/name form",
        );
    }
    finish(checks)?;

    let environment = Environment {
        id: Uuid::new_v4(),
        tenant_id,
        name: payload.name.trim().to_string(),
        class: payload.class,
        runtime_base_url: payload.runtime_base_url.trim_end_matches('/').to_string(),
        runtime_api_key: payload.runtime_api_key,
        git: payload.git.map(|git| GitTarget {
            repository: git.repository.trim().to_string(),
            branch: git.branch.unwrap_or_else(|| "main".to_string()),
            path_prefix: git.path_prefix.unwrap_or_else(|| "workflows".to_string()),
            token: git.token,
        }),
        last_git_head: None,
        created_at: Utc::now(),
    };
    state.repo.create_environment(&environment).await?;
    tracing::info!(
        "Registered {} environment '{}' ({})",
        environment.class.as_str(),
        environment.name,
        environment.id
    );

    Ok((StatusCode::CREATED, Json(environment)))
}

async fn get_environment(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Environment>> {
    Ok(Json(load_environment(&state, tenant_id, id).await?))
}

async fn delete_environment(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    load_environment(&state, tenant_id, id).await?;
    state.scanner.cancel(id);

    if !state.repo.delete_environment(tenant_id, id).await? {
        return Err(AppError::NotFound("Environment".to_string()));
    }
    tracing::info!("Deleted environment {}", id);
    Ok(StatusCode::NO_CONTENT)
}
