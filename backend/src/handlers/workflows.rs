use axum::{
    extract::{Path, State},
    response::Json,
    routing::get,
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ApiResult, AppError};
use crate::tenant::TenantContext;
use crate::AppState;
use flowops_shared::CanonicalWorkflow;

pub fn workflow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_workflows))
        .route("/:id", get(get_workflow))
}

async fn list_workflows(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
) -> ApiResult<Json<Vec<CanonicalWorkflow>>> {
    let mut workflows = state.repo.list_canonical_workflows(tenant_id).await?;
    workflows.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(Json(workflows))
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CanonicalWorkflow>> {
    state
        .repo
        .get_canonical_workflow(tenant_id, id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Workflow".to_string()))
}
