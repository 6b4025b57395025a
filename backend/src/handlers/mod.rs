use axum::{extract::State, http::StatusCode, response::Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::jobs::scheduler::JobExecutionLog;
use crate::AppState;

pub mod credentials;
pub mod drift;
pub mod environments;
pub mod promotions;
pub mod workflows;

pub use credentials::credential_routes;
pub use environments::environment_routes;
pub use promotions::promotion_routes;
pub use workflows::workflow_routes;

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub services: HashMap<String, ServiceStatus>,
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub status: String,
    pub response_time_ms: u64,
    pub details: Option<serde_json::Value>,
}

pub async fn health_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({"status": "healthy", "service": "flowops-api"})))
}

/// Storage health; 503 when the store does not answer
pub async fn detailed_health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthCheckResponse>) {
    let started = Instant::now();
    let healthy = state.repo.health_check().await;

    let storage = ServiceStatus {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        response_time_ms: started.elapsed().as_millis() as u64,
        details: Some(json!({ "backend": state.config.storage_backend.as_str() })),
    };
    let response = HealthCheckResponse {
        status: storage.status.clone(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        services: HashMap::from([("storage".to_string(), storage)]),
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

/// Recent scheduled job runs
pub async fn job_history(State(state): State<Arc<AppState>>) -> Json<Vec<JobExecutionLog>> {
    Json(state.job_history.recent().await)
}
