pub mod helpers;
pub mod integration;
pub mod unit;

// Common test utilities and shared test setup
use axum::Router;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{Config, StorageBackend};
use crate::store::{CredentialMappingStore, MemoryRepository, Repository};
use crate::AppState;
use flowops_shared::{Environment, EnvironmentClass};

use helpers::{FakeCollaborators, FakeGit, FakeRuntime};

pub struct TestContext {
    pub tenant_id: Uuid,
    pub repo: Arc<MemoryRepository>,
    pub collaborators: Arc<FakeCollaborators>,
    pub state: Arc<AppState>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let repo = Arc::new(MemoryRepository::new());
        let collaborators = Arc::new(FakeCollaborators::default());
        let state = Arc::new(AppState::new(
            config,
            repo.clone() as Arc<dyn Repository>,
            repo.clone() as Arc<dyn CredentialMappingStore>,
            collaborators.clone(),
        ));

        Self {
            tenant_id: Uuid::new_v4(),
            repo,
            collaborators,
            state,
        }
    }

    pub fn app(&self) -> Router {
        crate::app(self.state.clone())
    }

    pub async fn environment(&self, name: &str, class: EnvironmentClass, with_git: bool) -> Environment {
        let environment = fixtures::environment(self.tenant_id, name, class, with_git);
        self.repo.create_environment(&environment).await.unwrap();
        environment
    }

    /// Reload after scans moved the recorded Git head
    pub async fn reload(&self, environment: &Environment) -> Environment {
        self.repo
            .get_environment(self.tenant_id, environment.id)
            .await
            .unwrap()
            .unwrap()
    }

    pub fn runtime(&self, environment: &Environment) -> Arc<FakeRuntime> {
        self.collaborators.runtime_for(environment.id)
    }

    pub fn git(&self, environment: &Environment) -> Arc<FakeGit> {
        self.collaborators.git_for(environment.id)
    }
}

pub fn test_config() -> Config {
    Config {
        storage_backend: StorageBackend::Memory,
        scan_interval_minutes: 0,
        scan_concurrency: 4,
        fetch_max_retries: 0,
        ..Config::default()
    }
}
