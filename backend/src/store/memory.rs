use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use flowops_shared::{
    CanonicalWorkflow, CredentialMapping, DriftStatus, Environment, EnvironmentWorkflowState,
    LogicalCredential, Promotion, RuntimeLink,
};

use super::{
    check_mapping_type, BaselineUpdate, CredentialMappingStore, Repository, ScanCommit,
    ScanCommitOutcome, StoreError, StoreResult,
};

#[derive(Default)]
struct Inner {
    environments: HashMap<Uuid, Environment>,
    workflows: HashMap<Uuid, CanonicalWorkflow>,
    // (environment, canonical workflow) -> runtime workflow id
    links: HashMap<(Uuid, Uuid), String>,
    states: HashMap<(Uuid, Uuid), EnvironmentWorkflowState>,
    promotions: HashMap<Uuid, Promotion>,
    logical_credentials: HashMap<Uuid, LogicalCredential>,
    mappings: HashMap<Uuid, CredentialMapping>,
}

/// In-memory storage. One lock guards everything so each trait call is atomic.
#[derive(Default)]
pub struct MemoryRepository {
    inner: RwLock<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn health_check(&self) -> bool {
        true
    }

    async fn create_environment(&self, environment: &Environment) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let duplicate = inner
            .environments
            .values()
            .any(|e| e.tenant_id == environment.tenant_id && e.name == environment.name);
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "environment '{}' already exists",
                environment.name
            )));
        }
        inner.environments.insert(environment.id, environment.clone());
        Ok(())
    }

    async fn get_environment(&self, tenant_id: Uuid, id: Uuid) -> StoreResult<Option<Environment>> {
        let inner = self.inner.read().await;
        Ok(inner
            .environments
            .get(&id)
            .filter(|e| e.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_environments(&self, tenant_id: Uuid) -> StoreResult<Vec<Environment>> {
        let inner = self.inner.read().await;
        let mut environments: Vec<Environment> = inner
            .environments
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        environments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(environments)
    }

    async fn list_all_environments(&self) -> StoreResult<Vec<Environment>> {
        let inner = self.inner.read().await;
        Ok(inner.environments.values().cloned().collect())
    }

    async fn delete_environment(&self, tenant_id: Uuid, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let owned = inner
            .environments
            .get(&id)
            .is_some_and(|e| e.tenant_id == tenant_id);
        if !owned {
            return Ok(false);
        }
        inner.environments.remove(&id);
        inner.links.retain(|(env, _), _| *env != id);
        inner.states.retain(|(env, _), _| *env != id);
        inner.mappings.retain(|_, m| m.environment_id != id);
        Ok(true)
    }

    async fn set_last_git_head(&self, environment_id: Uuid, head: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let environment = inner
            .environments
            .get_mut(&environment_id)
            .ok_or_else(|| StoreError::NotFound("Environment".to_string()))?;
        environment.last_git_head = Some(head.to_string());
        Ok(())
    }

    async fn upsert_canonical_workflow(&self, workflow: &CanonicalWorkflow) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_canonical_workflow(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<CanonicalWorkflow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .workflows
            .get(&id)
            .filter(|w| w.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_canonical_workflows(&self, tenant_id: Uuid) -> StoreResult<Vec<CanonicalWorkflow>> {
        let inner = self.inner.read().await;
        let mut workflows: Vec<CanonicalWorkflow> = inner
            .workflows
            .values()
            .filter(|w| w.tenant_id == tenant_id)
            .cloned()
            .collect();
        workflows.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(workflows)
    }

    async fn link_runtime_workflow(
        &self,
        environment_id: Uuid,
        canonical_workflow_id: Uuid,
        runtime_workflow_id: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let taken = inner.links.iter().any(|((env, canonical), runtime)| {
            *env == environment_id
                && *canonical != canonical_workflow_id
                && runtime == runtime_workflow_id
        });
        if taken {
            return Err(StoreError::Conflict(format!(
                "runtime workflow '{}' is already linked",
                runtime_workflow_id
            )));
        }
        inner.links.insert(
            (environment_id, canonical_workflow_id),
            runtime_workflow_id.to_string(),
        );
        Ok(())
    }

    async fn list_runtime_links(&self, environment_id: Uuid) -> StoreResult<Vec<RuntimeLink>> {
        let inner = self.inner.read().await;
        Ok(inner
            .links
            .iter()
            .filter(|((env, _), _)| *env == environment_id)
            .map(|((env, canonical), runtime)| RuntimeLink {
                environment_id: *env,
                canonical_workflow_id: *canonical,
                runtime_workflow_id: runtime.clone(),
            })
            .collect())
    }

    async fn commit_scan(&self, commit: &ScanCommit) -> StoreResult<ScanCommitOutcome> {
        let mut inner = self.inner.write().await;
        if !inner.environments.contains_key(&commit.environment_id) {
            return Err(StoreError::NotFound("Environment".to_string()));
        }
        let mut outcome = ScanCommitOutcome::default();

        for (canonical_id, runtime_id) in &commit.new_links {
            let taken = inner.links.iter().any(|((env, canonical), runtime)| {
                *env == commit.environment_id && canonical != canonical_id && runtime == runtime_id
            });
            if taken {
                outcome.superseded.push(*canonical_id);
            }
        }
        for workflow in &commit.new_workflows {
            if !outcome.superseded.contains(&workflow.id) {
                inner.workflows.insert(workflow.id, workflow.clone());
            }
        }
        for (canonical_id, runtime_id) in &commit.new_links {
            if !outcome.superseded.contains(canonical_id) {
                inner
                    .links
                    .insert((commit.environment_id, *canonical_id), runtime_id.clone());
            }
        }

        for row in &commit.rows {
            if outcome.superseded.contains(&row.canonical_workflow_id) {
                outcome.discarded += 1;
                continue;
            }
            let key = (commit.environment_id, row.canonical_workflow_id);
            let stale = inner
                .states
                .get(&key)
                .is_some_and(|stored| stored.scan_started_at > commit.scan_started_at);
            if stale {
                outcome.discarded += 1;
                continue;
            }
            let mut row = row.clone();
            row.environment_id = commit.environment_id;
            row.scan_started_at = commit.scan_started_at;
            inner.states.insert(key, row);
            outcome.committed += 1;
        }

        Ok(outcome)
    }

    async fn set_baseline(&self, update: &BaselineUpdate) -> StoreResult<EnvironmentWorkflowState> {
        let mut inner = self.inner.write().await;
        let key = (update.environment_id, update.canonical_workflow_id);
        let git_hash = inner.states.get(&key).and_then(|s| s.git_hash.clone());

        let state = EnvironmentWorkflowState {
            tenant_id: update.tenant_id,
            environment_id: update.environment_id,
            canonical_workflow_id: update.canonical_workflow_id,
            baseline_hash: Some(update.hash.clone()),
            runtime_hash: Some(update.hash.clone()),
            git_hash,
            git_configured: update.git_configured,
            status: DriftStatus::InSync,
            error_message: None,
            scan_started_at: update.at,
            last_checked_at: update.at,
        };
        inner.states.insert(key, state.clone());
        Ok(state)
    }

    async fn get_workflow_state(
        &self,
        environment_id: Uuid,
        canonical_workflow_id: Uuid,
    ) -> StoreResult<Option<EnvironmentWorkflowState>> {
        let inner = self.inner.read().await;
        Ok(inner
            .states
            .get(&(environment_id, canonical_workflow_id))
            .cloned())
    }

    async fn list_workflow_states(
        &self,
        environment_id: Uuid,
    ) -> StoreResult<Vec<EnvironmentWorkflowState>> {
        let inner = self.inner.read().await;
        let mut states: Vec<EnvironmentWorkflowState> = inner
            .states
            .values()
            .filter(|s| s.environment_id == environment_id)
            .cloned()
            .collect();
        states.sort_by_key(|s| s.canonical_workflow_id);
        Ok(states)
    }

    async fn save_promotion(&self, promotion: &Promotion) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.promotions.insert(promotion.id, promotion.clone());
        Ok(())
    }

    async fn get_promotion(&self, tenant_id: Uuid, id: Uuid) -> StoreResult<Option<Promotion>> {
        let inner = self.inner.read().await;
        Ok(inner
            .promotions
            .get(&id)
            .filter(|p| p.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_promotions(&self, tenant_id: Uuid) -> StoreResult<Vec<Promotion>> {
        let inner = self.inner.read().await;
        let mut promotions: Vec<Promotion> = inner
            .promotions
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .cloned()
            .collect();
        promotions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(promotions)
    }
}

#[async_trait]
impl CredentialMappingStore for MemoryRepository {
    async fn list_logical_credentials(&self, tenant_id: Uuid) -> StoreResult<Vec<LogicalCredential>> {
        let inner = self.inner.read().await;
        let mut credentials: Vec<LogicalCredential> = inner
            .logical_credentials
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect();
        credentials.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(credentials)
    }

    async fn find_logical_credential(
        &self,
        tenant_id: Uuid,
        key: &str,
    ) -> StoreResult<Option<LogicalCredential>> {
        let inner = self.inner.read().await;
        Ok(inner
            .logical_credentials
            .values()
            .find(|c| c.tenant_id == tenant_id && c.key == key)
            .cloned())
    }

    async fn create_logical_credential(&self, credential: &LogicalCredential) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let exists = inner
            .logical_credentials
            .values()
            .any(|c| c.tenant_id == credential.tenant_id && c.key == credential.key);
        if exists {
            return Err(StoreError::Conflict(format!(
                "logical credential '{}' already exists",
                credential.key
            )));
        }
        inner
            .logical_credentials
            .insert(credential.id, credential.clone());
        Ok(())
    }

    async fn ensure_logical_credential(
        &self,
        tenant_id: Uuid,
        key: &str,
        name: &str,
        required_type: &str,
    ) -> StoreResult<LogicalCredential> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner
            .logical_credentials
            .values()
            .find(|c| c.tenant_id == tenant_id && c.key == key)
        {
            return Ok(existing.clone());
        }

        let credential = LogicalCredential {
            id: Uuid::new_v4(),
            tenant_id,
            key: key.to_string(),
            name: name.to_string(),
            required_type: required_type.to_string(),
            description: None,
            created_at: Utc::now(),
        };
        inner
            .logical_credentials
            .insert(credential.id, credential.clone());
        Ok(credential)
    }

    async fn get_mapping(
        &self,
        tenant_id: Uuid,
        logical_credential_id: Uuid,
        environment_id: Uuid,
    ) -> StoreResult<Option<CredentialMapping>> {
        let inner = self.inner.read().await;
        Ok(inner
            .mappings
            .values()
            .find(|m| {
                m.tenant_id == tenant_id
                    && m.logical_credential_id == logical_credential_id
                    && m.environment_id == environment_id
            })
            .cloned())
    }

    async fn find_mapping_by_physical(
        &self,
        environment_id: Uuid,
        physical_type: &str,
        physical_credential_id: &str,
    ) -> StoreResult<Option<CredentialMapping>> {
        let inner = self.inner.read().await;
        Ok(inner
            .mappings
            .values()
            .find(|m| {
                m.environment_id == environment_id
                    && m.physical_type == physical_type
                    && m.physical_credential_id == physical_credential_id
            })
            .cloned())
    }

    async fn list_mappings(
        &self,
        tenant_id: Uuid,
        environment_id: Uuid,
    ) -> StoreResult<Vec<CredentialMapping>> {
        let inner = self.inner.read().await;
        let mut mappings: Vec<CredentialMapping> = inner
            .mappings
            .values()
            .filter(|m| m.tenant_id == tenant_id && m.environment_id == environment_id)
            .cloned()
            .collect();
        mappings.sort_by_key(|m| m.created_at);
        Ok(mappings)
    }

    async fn upsert_mapping(&self, mapping: &CredentialMapping) -> StoreResult<CredentialMapping> {
        let mut inner = self.inner.write().await;
        let logical = inner
            .logical_credentials
            .get(&mapping.logical_credential_id)
            .filter(|c| c.tenant_id == mapping.tenant_id)
            .ok_or_else(|| StoreError::NotFound("Logical credential".to_string()))?;
        check_mapping_type(logical, mapping)?;

        let existing = inner
            .mappings
            .values()
            .find(|m| {
                m.tenant_id == mapping.tenant_id
                    && m.logical_credential_id == mapping.logical_credential_id
                    && m.environment_id == mapping.environment_id
            })
            .cloned();

        let stored = match existing {
            Some(existing) => CredentialMapping {
                id: existing.id,
                created_at: existing.created_at,
                updated_at: Some(Utc::now()),
                ..mapping.clone()
            },
            None => mapping.clone(),
        };
        inner.mappings.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn delete_mapping(&self, tenant_id: Uuid, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let owned = inner
            .mappings
            .get(&id)
            .is_some_and(|m| m.tenant_id == tenant_id);
        if owned {
            inner.mappings.remove(&id);
        }
        Ok(owned)
    }
}
