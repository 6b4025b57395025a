//! Persistence for environments, drift state, credential mappings and promotions.
//!
//! Two backends implement the same traits: [`PgRepository`] for production and
//! [`MemoryRepository`] for tests and single-node trials.

pub mod memory;
pub mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use flowops_shared::{
    CanonicalWorkflow, ContentHash, CredentialMapping, Environment, EnvironmentWorkflowState,
    LogicalCredential, Promotion, RuntimeLink,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("credential type mismatch: logical credential requires '{expected}', got '{actual}'")]
    TypeMismatch { expected: String, actual: String },

    #[error("stored data is corrupt: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One environment's scan results, committed as a single batch together with
/// the workflows and links discovered by the scan.
///
/// Committing to an environment that no longer exists fails with
/// [`StoreError::NotFound`] and writes nothing.
#[derive(Debug, Clone)]
pub struct ScanCommit {
    pub environment_id: Uuid,
    pub scan_started_at: DateTime<Utc>,
    pub new_workflows: Vec<CanonicalWorkflow>,
    /// (canonical workflow, runtime workflow id)
    pub new_links: Vec<(Uuid, String)>,
    pub rows: Vec<EnvironmentWorkflowState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanCommitOutcome {
    pub committed: usize,
    /// Rows skipped because the stored row came from a later scan
    pub discarded: usize,
    /// Discovered canonical workflows dropped because another scan linked
    /// their runtime workflow first; their rows count as discarded
    pub superseded: Vec<Uuid>,
}

/// New approved version for one (workflow, environment) pair.
///
/// The approved hash is also the observed runtime hash, so the row is stored
/// as `IN_SYNC`.
#[derive(Debug, Clone)]
pub struct BaselineUpdate {
    pub tenant_id: Uuid,
    pub environment_id: Uuid,
    pub canonical_workflow_id: Uuid,
    pub hash: ContentHash,
    pub git_configured: bool,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn health_check(&self) -> bool;

    // Environments
    async fn create_environment(&self, environment: &Environment) -> StoreResult<()>;
    async fn get_environment(&self, tenant_id: Uuid, id: Uuid) -> StoreResult<Option<Environment>>;
    async fn list_environments(&self, tenant_id: Uuid) -> StoreResult<Vec<Environment>>;
    /// Every environment of every tenant, for scheduled scans
    async fn list_all_environments(&self) -> StoreResult<Vec<Environment>>;
    /// Removes the environment with its links, state rows and mappings
    async fn delete_environment(&self, tenant_id: Uuid, id: Uuid) -> StoreResult<bool>;
    async fn set_last_git_head(&self, environment_id: Uuid, head: &str) -> StoreResult<()>;

    // Canonical workflows
    async fn upsert_canonical_workflow(&self, workflow: &CanonicalWorkflow) -> StoreResult<()>;
    async fn get_canonical_workflow(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<CanonicalWorkflow>>;
    async fn list_canonical_workflows(&self, tenant_id: Uuid) -> StoreResult<Vec<CanonicalWorkflow>>;

    // Runtime links
    async fn link_runtime_workflow(
        &self,
        environment_id: Uuid,
        canonical_workflow_id: Uuid,
        runtime_workflow_id: &str,
    ) -> StoreResult<()>;
    async fn list_runtime_links(&self, environment_id: Uuid) -> StoreResult<Vec<RuntimeLink>>;

    // Drift state
    /// Store a scan batch atomically. A row is only replaced when the stored
    /// row's `scan_started_at` is not later than the batch's.
    async fn commit_scan(&self, commit: &ScanCommit) -> StoreResult<ScanCommitOutcome>;
    async fn set_baseline(&self, update: &BaselineUpdate) -> StoreResult<EnvironmentWorkflowState>;
    async fn get_workflow_state(
        &self,
        environment_id: Uuid,
        canonical_workflow_id: Uuid,
    ) -> StoreResult<Option<EnvironmentWorkflowState>>;
    async fn list_workflow_states(
        &self,
        environment_id: Uuid,
    ) -> StoreResult<Vec<EnvironmentWorkflowState>>;

    // Promotions
    async fn save_promotion(&self, promotion: &Promotion) -> StoreResult<()>;
    async fn get_promotion(&self, tenant_id: Uuid, id: Uuid) -> StoreResult<Option<Promotion>>;
    async fn list_promotions(&self, tenant_id: Uuid) -> StoreResult<Vec<Promotion>>;
}

#[async_trait]
pub trait CredentialMappingStore: Send + Sync {
    async fn list_logical_credentials(&self, tenant_id: Uuid) -> StoreResult<Vec<LogicalCredential>>;
    async fn find_logical_credential(
        &self,
        tenant_id: Uuid,
        key: &str,
    ) -> StoreResult<Option<LogicalCredential>>;
    /// Fails with `Conflict` when the key already exists for the tenant
    async fn create_logical_credential(&self, credential: &LogicalCredential) -> StoreResult<()>;
    /// Get-or-create by `(tenant, key)`; concurrent callers observe one row
    async fn ensure_logical_credential(
        &self,
        tenant_id: Uuid,
        key: &str,
        name: &str,
        required_type: &str,
    ) -> StoreResult<LogicalCredential>;

    async fn get_mapping(
        &self,
        tenant_id: Uuid,
        logical_credential_id: Uuid,
        environment_id: Uuid,
    ) -> StoreResult<Option<CredentialMapping>>;
    async fn find_mapping_by_physical(
        &self,
        environment_id: Uuid,
        physical_type: &str,
        physical_credential_id: &str,
    ) -> StoreResult<Option<CredentialMapping>>;
    async fn list_mappings(
        &self,
        tenant_id: Uuid,
        environment_id: Uuid,
    ) -> StoreResult<Vec<CredentialMapping>>;
    /// Insert or replace the mapping for `(tenant, logical credential, environment)`.
    /// Rejects a physical type that differs from the logical credential's.
    async fn upsert_mapping(&self, mapping: &CredentialMapping) -> StoreResult<CredentialMapping>;
    async fn delete_mapping(&self, tenant_id: Uuid, id: Uuid) -> StoreResult<bool>;
}

pub(crate) fn check_mapping_type(
    logical: &LogicalCredential,
    mapping: &CredentialMapping,
) -> StoreResult<()> {
    if logical.required_type != mapping.physical_type {
        return Err(StoreError::TypeMismatch {
            expected: logical.required_type.clone(),
            actual: mapping.physical_type.clone(),
        });
    }
    Ok(())
}
