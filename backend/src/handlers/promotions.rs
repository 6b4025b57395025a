use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::error::{ApiResult, AppError};
use crate::pagination::{PaginatedResponse, PaginationParams};
use crate::tenant::TenantContext;
use crate::validation::validate_payload;
use crate::AppState;
use flowops_shared::{PreflightResult, Promotion};

#[derive(Debug, Deserialize, Validate)]
pub struct PromotionRequest {
    pub source_environment_id: Uuid,
    pub target_environment_id: Uuid,
    #[validate(length(min = 1, max = 200, message = "Select between 1 and 200 workflows"))]
    pub workflow_ids: Vec<Uuid>,
}

pub fn promotion_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_promotions).post(create_promotion))
        .route("/preflight", post(run_preflight))
        .route("/:id", get(get_promotion))
}

async fn run_preflight(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Json(payload): Json<PromotionRequest>,
) -> ApiResult<Json<PreflightResult>> {
    validate_payload(&payload)?;
    let result = state
        .preflight
        .preflight(
            tenant_id,
            &payload.workflow_ids,
            payload.source_environment_id,
            payload.target_environment_id,
        )
        .await?;
    Ok(Json(result))
}

async fn create_promotion(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Json(payload): Json<PromotionRequest>,
) -> ApiResult<(StatusCode, Json<Promotion>)> {
    validate_payload(&payload)?;
    let promotion = state
        .orchestrator
        .promote(
            tenant_id,
            payload.source_environment_id,
            payload.target_environment_id,
            &payload.workflow_ids,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(promotion)))
}

async fn list_promotions(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Query(params): Query<PaginationParams>,
) -> ApiResult<Json<PaginatedResponse<Promotion>>> {
    let mut promotions = state.repo.list_promotions(tenant_id).await?;
    promotions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(params.paginate(promotions)))
}

async fn get_promotion(
    State(state): State<Arc<AppState>>,
    TenantContext(tenant_id): TenantContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Promotion>> {
    state
        .repo
        .get_promotion(tenant_id, id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Promotion".to_string()))
}
