use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use flowops_shared::{
    CanonicalWorkflow, ContentHash, CredentialMapping, DriftStatus, Environment,
    EnvironmentWorkflowState, GitTarget, LogicalCredential, Promotion, RuntimeLink,
};

use super::{
    check_mapping_type, BaselineUpdate, CredentialMappingStore, Repository, ScanCommit,
    ScanCommitOutcome, StoreError, StoreResult,
};

const UNIQUE_VIOLATION: &str = "23505";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

#[derive(sqlx::FromRow)]
struct EnvironmentRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    class: String,
    runtime_base_url: String,
    runtime_api_key: String,
    git_repository: Option<String>,
    git_branch: Option<String>,
    git_path_prefix: Option<String>,
    git_token: Option<String>,
    last_git_head: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EnvironmentRow> for Environment {
    type Error = StoreError;

    fn try_from(row: EnvironmentRow) -> Result<Self, Self::Error> {
        let git = row.git_repository.map(|repository| GitTarget {
            repository,
            branch: row.git_branch.unwrap_or_else(|| "main".to_string()),
            path_prefix: row.git_path_prefix.unwrap_or_default(),
            token: row.git_token.unwrap_or_default(),
        });

        Ok(Environment {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            class: row.class.parse().map_err(StoreError::Corrupt)?,
            runtime_base_url: row.runtime_base_url,
            runtime_api_key: row.runtime_api_key,
            git,
            last_git_head: row.last_git_head,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StateRow {
    tenant_id: Uuid,
    environment_id: Uuid,
    canonical_workflow_id: Uuid,
    baseline_hash: Option<String>,
    runtime_hash: Option<String>,
    git_hash: Option<String>,
    git_configured: bool,
    status: String,
    error_message: Option<String>,
    scan_started_at: DateTime<Utc>,
    last_checked_at: DateTime<Utc>,
}

impl TryFrom<StateRow> for EnvironmentWorkflowState {
    type Error = StoreError;

    fn try_from(row: StateRow) -> Result<Self, Self::Error> {
        Ok(EnvironmentWorkflowState {
            tenant_id: row.tenant_id,
            environment_id: row.environment_id,
            canonical_workflow_id: row.canonical_workflow_id,
            baseline_hash: row.baseline_hash.map(ContentHash::new),
            runtime_hash: row.runtime_hash.map(ContentHash::new),
            git_hash: row.git_hash.map(ContentHash::new),
            git_configured: row.git_configured,
            status: row.status.parse::<DriftStatus>().map_err(StoreError::Corrupt)?,
            error_message: row.error_message,
            scan_started_at: row.scan_started_at,
            last_checked_at: row.last_checked_at,
        })
    }
}

const ENVIRONMENT_COLUMNS: &str = "id, tenant_id, name, class, runtime_base_url, runtime_api_key, \
     git_repository, git_branch, git_path_prefix, git_token, last_git_head, created_at";

const STATE_COLUMNS: &str = "tenant_id, environment_id, canonical_workflow_id, baseline_hash, \
     runtime_hash, git_hash, git_configured, status, error_message, scan_started_at, last_checked_at";

const WORKFLOW_COLUMNS: &str =
    "id, tenant_id, name, content_hash, git_path, git_commit_sha, created_at, updated_at";

const LOGICAL_COLUMNS: &str = "id, tenant_id, key, name, required_type, description, created_at";

const MAPPING_COLUMNS: &str = "id, tenant_id, logical_credential_id, environment_id, \
     physical_credential_id, physical_name, physical_type, created_at, updated_at";

/// PostgreSQL storage
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn health_check(&self) -> bool {
        crate::database::health_check(&self.pool).await
    }

    async fn create_environment(&self, environment: &Environment) -> StoreResult<()> {
        let git = environment.git.as_ref();
        let result = sqlx::query(
            "INSERT INTO environments (id, tenant_id, name, class, runtime_base_url, runtime_api_key,
                 git_repository, git_branch, git_path_prefix, git_token, last_git_head, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(environment.id)
        .bind(environment.tenant_id)
        .bind(&environment.name)
        .bind(environment.class.as_str())
        .bind(&environment.runtime_base_url)
        .bind(&environment.runtime_api_key)
        .bind(git.map(|g| g.repository.as_str()))
        .bind(git.map(|g| g.branch.as_str()))
        .bind(git.map(|g| g.path_prefix.as_str()))
        .bind(git.map(|g| g.token.as_str()))
        .bind(environment.last_git_head.as_deref())
        .bind(environment.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                "environment '{}' already exists",
                environment.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_environment(&self, tenant_id: Uuid, id: Uuid) -> StoreResult<Option<Environment>> {
        let row = sqlx::query_as::<_, EnvironmentRow>(&format!(
            "SELECT {} FROM environments WHERE tenant_id = $1 AND id = $2",
            ENVIRONMENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Environment::try_from).transpose()
    }

    async fn list_environments(&self, tenant_id: Uuid) -> StoreResult<Vec<Environment>> {
        let rows = sqlx::query_as::<_, EnvironmentRow>(&format!(
            "SELECT {} FROM environments WHERE tenant_id = $1 ORDER BY created_at, name",
            ENVIRONMENT_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Environment::try_from).collect()
    }

    async fn list_all_environments(&self) -> StoreResult<Vec<Environment>> {
        let rows = sqlx::query_as::<_, EnvironmentRow>(&format!(
            "SELECT {} FROM environments ORDER BY tenant_id, created_at",
            ENVIRONMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Environment::try_from).collect()
    }

    async fn delete_environment(&self, tenant_id: Uuid, id: Uuid) -> StoreResult<bool> {
        // Links, state rows and mappings cascade
        let result = sqlx::query("DELETE FROM environments WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_last_git_head(&self, environment_id: Uuid, head: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE environments SET last_git_head = $2 WHERE id = $1")
            .bind(environment_id)
            .bind(head)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("Environment".to_string()));
        }
        Ok(())
    }

    async fn upsert_canonical_workflow(&self, workflow: &CanonicalWorkflow) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO canonical_workflows (id, tenant_id, name, content_hash, git_path, git_commit_sha, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO UPDATE SET
                 name = EXCLUDED.name,
                 content_hash = EXCLUDED.content_hash,
                 git_path = EXCLUDED.git_path,
                 git_commit_sha = EXCLUDED.git_commit_sha,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(workflow.id)
        .bind(workflow.tenant_id)
        .bind(&workflow.name)
        .bind(workflow.content_hash.as_deref())
        .bind(workflow.git_path.as_deref())
        .bind(workflow.git_commit_sha.as_deref())
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_canonical_workflow(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<CanonicalWorkflow>> {
        let workflow = sqlx::query_as::<_, CanonicalWorkflow>(&format!(
            "SELECT {} FROM canonical_workflows WHERE tenant_id = $1 AND id = $2",
            WORKFLOW_COLUMNS
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(workflow)
    }

    async fn list_canonical_workflows(&self, tenant_id: Uuid) -> StoreResult<Vec<CanonicalWorkflow>> {
        let workflows = sqlx::query_as::<_, CanonicalWorkflow>(&format!(
            "SELECT {} FROM canonical_workflows WHERE tenant_id = $1 ORDER BY name, id",
            WORKFLOW_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(workflows)
    }

    async fn link_runtime_workflow(
        &self,
        environment_id: Uuid,
        canonical_workflow_id: Uuid,
        runtime_workflow_id: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO runtime_links (environment_id, canonical_workflow_id, runtime_workflow_id)
             VALUES ($1, $2, $3)
             ON CONFLICT (environment_id, canonical_workflow_id)
             DO UPDATE SET runtime_workflow_id = EXCLUDED.runtime_workflow_id",
        )
        .bind(environment_id)
        .bind(canonical_workflow_id)
        .bind(runtime_workflow_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                "runtime workflow '{}' is already linked",
                runtime_workflow_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_runtime_links(&self, environment_id: Uuid) -> StoreResult<Vec<RuntimeLink>> {
        let links = sqlx::query_as::<_, RuntimeLink>(
            "SELECT environment_id, canonical_workflow_id, runtime_workflow_id
             FROM runtime_links WHERE environment_id = $1",
        )
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(links)
    }

    async fn commit_scan(&self, commit: &ScanCommit) -> StoreResult<ScanCommitOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = ScanCommitOutcome::default();

        // Blocks a concurrent delete until the batch is stored
        let exists = sqlx::query("SELECT 1 FROM environments WHERE id = $1 FOR SHARE")
            .bind(commit.environment_id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Err(StoreError::NotFound("Environment".to_string()));
        }

        for workflow in &commit.new_workflows {
            sqlx::query(
                "INSERT INTO canonical_workflows (id, tenant_id, name, content_hash, git_path, git_commit_sha, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(workflow.id)
            .bind(workflow.tenant_id)
            .bind(&workflow.name)
            .bind(workflow.content_hash.as_deref())
            .bind(workflow.git_path.as_deref())
            .bind(workflow.git_commit_sha.as_deref())
            .bind(workflow.created_at)
            .bind(workflow.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for (canonical_id, runtime_id) in &commit.new_links {
            let inserted: Option<Uuid> = sqlx::query_scalar(
                "INSERT INTO runtime_links (environment_id, canonical_workflow_id, runtime_workflow_id)
                 VALUES ($1, $2, $3)
                 ON CONFLICT DO NOTHING
                 RETURNING canonical_workflow_id",
            )
            .bind(commit.environment_id)
            .bind(canonical_id)
            .bind(runtime_id)
            .fetch_optional(&mut *tx)
            .await?;
            if inserted.is_some() {
                continue;
            }

            let owner: Option<Uuid> = sqlx::query_scalar(
                "SELECT canonical_workflow_id FROM runtime_links
                 WHERE environment_id = $1 AND runtime_workflow_id = $2",
            )
            .bind(commit.environment_id)
            .bind(runtime_id)
            .fetch_optional(&mut *tx)
            .await?;
            if owner != Some(*canonical_id) {
                outcome.superseded.push(*canonical_id);
            }
        }

        let orphaned: Vec<Uuid> = commit
            .new_workflows
            .iter()
            .map(|w| w.id)
            .filter(|id| outcome.superseded.contains(id))
            .collect();
        if !orphaned.is_empty() {
            sqlx::query(
                "DELETE FROM canonical_workflows c WHERE c.id = ANY($1)
                 AND NOT EXISTS (SELECT 1 FROM runtime_links l WHERE l.canonical_workflow_id = c.id)",
            )
            .bind(&orphaned)
            .execute(&mut *tx)
            .await?;
        }

        for row in &commit.rows {
            if outcome.superseded.contains(&row.canonical_workflow_id) {
                outcome.discarded += 1;
                continue;
            }
            // The WHERE clause turns a stale row into a no-op
            let result = sqlx::query(
                "INSERT INTO environment_workflow_states
                     (tenant_id, environment_id, canonical_workflow_id, baseline_hash, runtime_hash,
                      git_hash, git_configured, status, error_message, scan_started_at, last_checked_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (environment_id, canonical_workflow_id) DO UPDATE SET
                     baseline_hash = EXCLUDED.baseline_hash,
                     runtime_hash = EXCLUDED.runtime_hash,
                     git_hash = EXCLUDED.git_hash,
                     git_configured = EXCLUDED.git_configured,
                     status = EXCLUDED.status,
                     error_message = EXCLUDED.error_message,
                     scan_started_at = EXCLUDED.scan_started_at,
                     last_checked_at = EXCLUDED.last_checked_at
                 WHERE environment_workflow_states.scan_started_at <= EXCLUDED.scan_started_at",
            )
            .bind(row.tenant_id)
            .bind(commit.environment_id)
            .bind(row.canonical_workflow_id)
            .bind(row.baseline_hash.as_ref().map(ContentHash::as_str))
            .bind(row.runtime_hash.as_ref().map(ContentHash::as_str))
            .bind(row.git_hash.as_ref().map(ContentHash::as_str))
            .bind(row.git_configured)
            .bind(row.status.as_str())
            .bind(row.error_message.as_deref())
            .bind(commit.scan_started_at)
            .bind(row.last_checked_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                outcome.discarded += 1;
            } else {
                outcome.committed += 1;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn set_baseline(&self, update: &BaselineUpdate) -> StoreResult<EnvironmentWorkflowState> {
        let row = sqlx::query_as::<_, StateRow>(&format!(
            "INSERT INTO environment_workflow_states
                 (tenant_id, environment_id, canonical_workflow_id, baseline_hash, runtime_hash,
                  git_hash, git_configured, status, error_message, scan_started_at, last_checked_at)
             VALUES ($1, $2, $3, $4, $4, NULL, $5, $6, NULL, $7, $7)
             ON CONFLICT (environment_id, canonical_workflow_id) DO UPDATE SET
                 baseline_hash = EXCLUDED.baseline_hash,
                 runtime_hash = EXCLUDED.runtime_hash,
                 git_configured = EXCLUDED.git_configured,
                 status = EXCLUDED.status,
                 error_message = NULL,
                 scan_started_at = EXCLUDED.scan_started_at,
                 last_checked_at = EXCLUDED.last_checked_at
             RETURNING {}",
            STATE_COLUMNS
        ))
        .bind(update.tenant_id)
        .bind(update.environment_id)
        .bind(update.canonical_workflow_id)
        .bind(update.hash.as_str())
        .bind(update.git_configured)
        .bind(DriftStatus::InSync.as_str())
        .bind(update.at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_workflow_state(
        &self,
        environment_id: Uuid,
        canonical_workflow_id: Uuid,
    ) -> StoreResult<Option<EnvironmentWorkflowState>> {
        let row = sqlx::query_as::<_, StateRow>(&format!(
            "SELECT {} FROM environment_workflow_states
             WHERE environment_id = $1 AND canonical_workflow_id = $2",
            STATE_COLUMNS
        ))
        .bind(environment_id)
        .bind(canonical_workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EnvironmentWorkflowState::try_from).transpose()
    }

    async fn list_workflow_states(
        &self,
        environment_id: Uuid,
    ) -> StoreResult<Vec<EnvironmentWorkflowState>> {
        let rows = sqlx::query_as::<_, StateRow>(&format!(
            "SELECT {} FROM environment_workflow_states
             WHERE environment_id = $1 ORDER BY canonical_workflow_id",
            STATE_COLUMNS
        ))
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EnvironmentWorkflowState::try_from).collect()
    }

    async fn save_promotion(&self, promotion: &Promotion) -> StoreResult<()> {
        let document = serde_json::to_value(promotion)?;
        sqlx::query(
            "INSERT INTO promotions (id, tenant_id, source_environment_id, target_environment_id,
                 state, document, created_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO UPDATE SET
                 state = EXCLUDED.state,
                 document = EXCLUDED.document,
                 completed_at = EXCLUDED.completed_at",
        )
        .bind(promotion.id)
        .bind(promotion.tenant_id)
        .bind(promotion.source_environment_id)
        .bind(promotion.target_environment_id)
        .bind(promotion.state.as_str())
        .bind(document)
        .bind(promotion.created_at)
        .bind(promotion.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_promotion(&self, tenant_id: Uuid, id: Uuid) -> StoreResult<Option<Promotion>> {
        let document: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT document FROM promotions WHERE tenant_id = $1 AND id = $2")
                .bind(tenant_id)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(document.map(serde_json::from_value).transpose()?)
    }

    async fn list_promotions(&self, tenant_id: Uuid) -> StoreResult<Vec<Promotion>> {
        let documents: Vec<serde_json::Value> = sqlx::query_scalar(
            "SELECT document FROM promotions WHERE tenant_id = $1 ORDER BY created_at DESC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        documents
            .into_iter()
            .map(|d| serde_json::from_value(d).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl CredentialMappingStore for PgRepository {
    async fn list_logical_credentials(&self, tenant_id: Uuid) -> StoreResult<Vec<LogicalCredential>> {
        let credentials = sqlx::query_as::<_, LogicalCredential>(&format!(
            "SELECT {} FROM logical_credentials WHERE tenant_id = $1 ORDER BY key",
            LOGICAL_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(credentials)
    }

    async fn find_logical_credential(
        &self,
        tenant_id: Uuid,
        key: &str,
    ) -> StoreResult<Option<LogicalCredential>> {
        let credential = sqlx::query_as::<_, LogicalCredential>(&format!(
            "SELECT {} FROM logical_credentials WHERE tenant_id = $1 AND key = $2",
            LOGICAL_COLUMNS
        ))
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(credential)
    }

    async fn create_logical_credential(&self, credential: &LogicalCredential) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO logical_credentials (id, tenant_id, key, name, required_type, description, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(credential.id)
        .bind(credential.tenant_id)
        .bind(&credential.key)
        .bind(&credential.name)
        .bind(&credential.required_type)
        .bind(credential.description.as_deref())
        .bind(credential.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                "logical credential '{}' already exists",
                credential.key
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_logical_credential(
        &self,
        tenant_id: Uuid,
        key: &str,
        name: &str,
        required_type: &str,
    ) -> StoreResult<LogicalCredential> {
        // The unique (tenant_id, key) constraint settles concurrent creators
        sqlx::query(
            "INSERT INTO logical_credentials (id, tenant_id, key, name, required_type, created_at)
             VALUES ($1, $2, $3, $4, $5, NOW())
             ON CONFLICT (tenant_id, key) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(key)
        .bind(name)
        .bind(required_type)
        .execute(&self.pool)
        .await?;

        self.find_logical_credential(tenant_id, key)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Logical credential '{}'", key)))
    }

    async fn get_mapping(
        &self,
        tenant_id: Uuid,
        logical_credential_id: Uuid,
        environment_id: Uuid,
    ) -> StoreResult<Option<CredentialMapping>> {
        let mapping = sqlx::query_as::<_, CredentialMapping>(&format!(
            "SELECT {} FROM credential_mappings
             WHERE tenant_id = $1 AND logical_credential_id = $2 AND environment_id = $3",
            MAPPING_COLUMNS
        ))
        .bind(tenant_id)
        .bind(logical_credential_id)
        .bind(environment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(mapping)
    }

    async fn find_mapping_by_physical(
        &self,
        environment_id: Uuid,
        physical_type: &str,
        physical_credential_id: &str,
    ) -> StoreResult<Option<CredentialMapping>> {
        let mapping = sqlx::query_as::<_, CredentialMapping>(&format!(
            "SELECT {} FROM credential_mappings
             WHERE environment_id = $1 AND physical_type = $2 AND physical_credential_id = $3
             LIMIT 1",
            MAPPING_COLUMNS
        ))
        .bind(environment_id)
        .bind(physical_type)
        .bind(physical_credential_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(mapping)
    }

    async fn list_mappings(
        &self,
        tenant_id: Uuid,
        environment_id: Uuid,
    ) -> StoreResult<Vec<CredentialMapping>> {
        let mappings = sqlx::query_as::<_, CredentialMapping>(&format!(
            "SELECT {} FROM credential_mappings
             WHERE tenant_id = $1 AND environment_id = $2 ORDER BY created_at",
            MAPPING_COLUMNS
        ))
        .bind(tenant_id)
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(mappings)
    }

    async fn upsert_mapping(&self, mapping: &CredentialMapping) -> StoreResult<CredentialMapping> {
        let mut tx = self.pool.begin().await?;

        let logical = sqlx::query_as::<_, LogicalCredential>(&format!(
            "SELECT {} FROM logical_credentials WHERE tenant_id = $1 AND id = $2 FOR SHARE",
            LOGICAL_COLUMNS
        ))
        .bind(mapping.tenant_id)
        .bind(mapping.logical_credential_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound("Logical credential".to_string()))?;
        check_mapping_type(&logical, mapping)?;

        let stored = sqlx::query_as::<_, CredentialMapping>(&format!(
            "INSERT INTO credential_mappings
                 (id, tenant_id, logical_credential_id, environment_id, physical_credential_id,
                  physical_name, physical_type, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (tenant_id, logical_credential_id, environment_id) DO UPDATE SET
                 physical_credential_id = EXCLUDED.physical_credential_id,
                 physical_name = EXCLUDED.physical_name,
                 physical_type = EXCLUDED.physical_type,
                 updated_at = NOW()
             RETURNING {}",
            MAPPING_COLUMNS
        ))
        .bind(mapping.id)
        .bind(mapping.tenant_id)
        .bind(mapping.logical_credential_id)
        .bind(mapping.environment_id)
        .bind(&mapping.physical_credential_id)
        .bind(&mapping.physical_name)
        .bind(&mapping.physical_type)
        .bind(mapping.created_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn delete_mapping(&self, tenant_id: Uuid, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM credential_mappings WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
