use axum::{http::Method, routing::get, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod credentials;
mod database;
mod drift;
mod error;
mod handlers;
mod identity;
mod integrations;
mod jobs;
mod pagination;
mod promotion;
mod store;
mod tenant;
mod validation;

pub use error::{ApiError, ApiResult, AppError};
pub use pagination::{PaginatedResponse, PaginationMeta, PaginationParams};

#[cfg(test)]
mod tests;

use config::{Config, StorageBackend};
use credentials::PreflightResolver;
use drift::EnvironmentScanner;
use integrations::{CollaboratorFactory, HttpCollaborators};
use jobs::JobHistory;
use promotion::{BaselineApprover, PromotionOrchestrator};
use store::{CredentialMappingStore, MemoryRepository, PgRepository, Repository};

pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub credentials: Arc<dyn CredentialMappingStore>,
    pub scanner: Arc<EnvironmentScanner>,
    pub preflight: Arc<PreflightResolver>,
    pub orchestrator: Arc<PromotionOrchestrator>,
    pub approver: Arc<BaselineApprover>,
    pub job_history: Arc<JobHistory>,
    pub config: Config,
}

impl AppState {
    pub fn new(
        config: Config,
        repo: Arc<dyn Repository>,
        credentials: Arc<dyn CredentialMappingStore>,
        collaborators: Arc<dyn CollaboratorFactory>,
    ) -> Self {
        let scanner = Arc::new(EnvironmentScanner::new(
            repo.clone(),
            credentials.clone(),
            collaborators.clone(),
            config.scan_concurrency,
        ));
        let preflight = Arc::new(PreflightResolver::new(
            repo.clone(),
            credentials.clone(),
            collaborators.clone(),
            config.preflight_block_on_missing_logical,
        ));
        let orchestrator = Arc::new(PromotionOrchestrator::new(
            repo.clone(),
            credentials.clone(),
            collaborators.clone(),
            preflight.clone(),
        ));
        let approver = Arc::new(BaselineApprover::new(
            repo.clone(),
            credentials.clone(),
            collaborators,
        ));

        Self {
            repo,
            credentials,
            scanner,
            preflight,
            orchestrator,
            approver,
            job_history: Arc::new(JobHistory::new()),
            config,
        }
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "flowops control plane API v1" }))
        .route("/health", get(handlers::health_check))
        .route("/health/detailed", get(handlers::detailed_health_check))
        .route("/health/jobs", get(handlers::job_history))
        .nest("/api/v1/environments", handlers::environment_routes())
        .nest("/api/v1/workflows", handlers::workflow_routes())
        .nest("/api/v1/credentials", handlers::credential_routes())
        .nest("/api/v1/promotions", handlers::promotion_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let (repo, credentials): (Arc<dyn Repository>, Arc<dyn CredentialMappingStore>) =
        match config.storage_backend {
            StorageBackend::Postgres => {
                let pool = database::create_pool(&config.database_url).await?;
                database::migrate(&pool).await?;
                let store = Arc::new(PgRepository::new(pool));
                (store.clone(), store)
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage; state is lost on restart");
                let store = Arc::new(MemoryRepository::new());
                (store.clone(), store)
            }
        };
    let collaborators: Arc<dyn CollaboratorFactory> = Arc::new(HttpCollaborators::new(&config)?);

    let state = Arc::new(AppState::new(config.clone(), repo, credentials, collaborators));

    let mut scheduler = jobs::JobScheduler::new(
        state.scanner.clone(),
        state.job_history.clone(),
        jobs::JobConfig {
            scan_interval_minutes: config.scan_interval_minutes,
        },
    )
    .await?;
    scheduler.start().await?;

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped, shutting down scheduler");
    scheduler.shutdown().await?;

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
