use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::drift::status_view;
use crate::error::{ApiResult, AppError};
use crate::pagination::{PaginatedResponse, PaginationParams};
use crate::promotion::Approval;
use crate::tenant::TenantContext;
use crate::AppState;
use flowops_shared::{DriftStatusView, ScanReport};

use super::environments::load_environment;

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub environment_id: Uuid,
    pub cancelled: bool,
}

pub fn drift_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id/scan", post(scan_environment))
        .route("/:id/cancel-scan", post(cancel_scan))
        .route("/:id/drift", get(list_drift))
        .route("/:id/drift/:workflow_id", get(get_drift))
        .route("/:id/workflows/:workflow_id/approve", post(approve_workflow))
}

async fn scan_environment(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ScanReport>> {
    let environment = load_environment(&state, tenant_id, id).await?;
    Ok(Json(state.scanner.scan_environment(&environment).await?))
}

async fn cancel_scan(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CancelResponse>> {
    load_environment(&state, tenant_id, id).await?;
    Ok(Json(CancelResponse {
        environment_id: id,
        cancelled: state.scanner.cancel(id),
    }))
}

async fn workflow_names(state: &AppState, tenant_id: Uuid) -> ApiResult<HashMap<Uuid, String>> {
    Ok(state
        .repo
        .list_canonical_workflows(tenant_id)
        .await?
        .into_iter()
        .map(|w| (w.id, w.name))
        .collect())
}

async fn list_drift(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Path(id): Path<Uuid>,
    Query(params): Query<PaginationParams>,
) -> ApiResult<Json<PaginatedResponse<DriftStatusView>>> {
    let environment = load_environment(&state, tenant_id, id).await?;
    let mut names = workflow_names(&state, tenant_id).await?;

    let mut views: Vec<DriftStatusView> = state
        .repo
        .list_workflow_states(environment.id)
        .await?
        .iter()
        .map(|row| status_view(row, names.remove(&row.canonical_workflow_id), environment.class))
        .collect();
    // Most severe first, then by name
    views.sort_by(|a, b| {
        b.status
            .severity()
            .cmp(&a.status.severity())
            .then_with(|| a.workflow_name.cmp(&b.workflow_name))
    });

    Ok(Json(params.paginate(views)))
}

async fn get_drift(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Path((id, workflow_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<DriftStatusView>> {
    let environment = load_environment(&state, tenant_id, id).await?;
    let workflow = state
        .repo
        .get_canonical_workflow(tenant_id, workflow_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Workflow".to_string()))?;
    let row = state
        .repo
        .get_workflow_state(environment.id, workflow_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Drift status".to_string()))?;

    Ok(Json(status_view(&row, Some(workflow.name), environment.class)))
}

async fn approve_workflow(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Path((id, workflow_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Approval>> {
    Ok(Json(state.approver.approve(tenant_id, id, workflow_id).await?))
}
