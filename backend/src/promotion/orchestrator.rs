use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use flowops_shared::{
    CanonicalWorkflow, CredentialMapping, Environment, Promotion, PromotionState,
    ResolvedMapping, WorkflowPromotionResult,
};

use crate::credentials::{
    credential_key_map, logical_name, EvaluatedPreflight, KeyedLocks, PreflightError,
    PreflightResolver, SourceWorkflow,
};
use crate::identity::{
    content_hash, credential_refs, portable_definition, substitute_credentials, CredentialKeyMap,
    CredentialSubstitutions, Substitution,
};
use crate::integrations::{CollaboratorFactory, FetchError, GitProvider, RuntimeClient};
use crate::store::{BaselineUpdate, CredentialMappingStore, Repository, StoreError};

#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("promotion {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: &'static str,
        to: &'static str,
    },

    #[error("no workflows selected")]
    NoWorkflows,

    #[error(transparent)]
    Preflight(#[from] PreflightError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Runs promotions through `PENDING → PREFLIGHT_CHECKED → APPLYING → COMPLETED | FAILED`
pub struct PromotionOrchestrator {
    repo: Arc<dyn Repository>,
    credentials: Arc<dyn CredentialMappingStore>,
    collaborators: Arc<dyn CollaboratorFactory>,
    preflight: Arc<PreflightResolver>,
    locks: KeyedLocks,
}

impl PromotionOrchestrator {
    pub fn new(
        repo: Arc<dyn Repository>,
        credentials: Arc<dyn CredentialMappingStore>,
        collaborators: Arc<dyn CollaboratorFactory>,
        preflight: Arc<PreflightResolver>,
    ) -> Self {
        Self {
            repo,
            credentials,
            collaborators,
            preflight,
            locks: KeyedLocks::new(),
        }
    }

    /// Create and run a promotion to a terminal state.
    ///
    /// Environment lookup and preflight errors are returned before anything is
    /// persisted; everything after that ends in a stored `COMPLETED` or `FAILED`.
    #[instrument(skip(self, workflow_ids), fields(workflows = workflow_ids.len()))]
    pub async fn promote(
        &self,
        tenant_id: Uuid,
        source_environment_id: Uuid,
        target_environment_id: Uuid,
        workflow_ids: &[Uuid],
    ) -> Result<Promotion, PromotionError> {
        let mut seen = BTreeSet::new();
        let workflow_ids: Vec<Uuid> = workflow_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();
        if workflow_ids.is_empty() {
            return Err(PromotionError::NoWorkflows);
        }

        let evaluated = self
            .preflight
            .evaluate(tenant_id, &workflow_ids, source_environment_id, target_environment_id)
            .await?;

        let mut promotion = Promotion {
            id: Uuid::new_v4(),
            tenant_id,
            source_environment_id,
            target_environment_id,
            workflow_ids,
            state: PromotionState::Pending,
            preflight: Some(evaluated.result.clone()),
            results: Vec::new(),
            failure_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.repo.save_promotion(&promotion).await?;

        if !evaluated.result.is_clear() {
            let reason = blocked_reason(&evaluated);
            tracing::warn!("Promotion {} blocked by preflight: {}", promotion.id, reason);
            self.transition(&mut promotion, PromotionState::Failed)?;
            promotion.failure_reason = Some(reason);
            promotion.completed_at = Some(Utc::now());
            self.repo.save_promotion(&promotion).await?;
            return Ok(promotion);
        }

        self.transition(&mut promotion, PromotionState::PreflightChecked)?;
        self.repo.save_promotion(&promotion).await?;
        self.transition(&mut promotion, PromotionState::Applying)?;
        self.repo.save_promotion(&promotion).await?;

        match self.apply(&mut promotion, &evaluated).await {
            Ok(()) => {
                let failed: Vec<&str> = promotion
                    .results
                    .iter()
                    .filter(|r| !r.succeeded)
                    .map(|r| r.workflow_name.as_str())
                    .collect();
                if failed.is_empty() {
                    self.transition(&mut promotion, PromotionState::Completed)?;
                } else {
                    promotion.failure_reason =
                        Some(format!("Failed to apply workflows: {}", failed.join(", ")));
                    self.transition(&mut promotion, PromotionState::Failed)?;
                }
            }
            Err(e) => {
                tracing::error!("Promotion {} aborted: {}", promotion.id, e);
                for workflow_id in promotion.workflow_ids.clone() {
                    if promotion.results.iter().any(|r| r.workflow_id == workflow_id) {
                        continue;
                    }
                    let name = evaluated
                        .workflows
                        .get(&workflow_id)
                        .map(|w| w.canonical.name.clone())
                        .unwrap_or_else(|| workflow_id.to_string());
                    promotion.results.push(WorkflowPromotionResult {
                        workflow_id,
                        workflow_name: name,
                        succeeded: false,
                        runtime_workflow_id: None,
                        applied_hash: None,
                        error: Some(format!("Promotion aborted: {}", e)),
                        warning: None,
                    });
                }
                promotion.failure_reason = Some(e.to_string());
                self.transition(&mut promotion, PromotionState::Failed)?;
            }
        }

        promotion.completed_at = Some(Utc::now());
        self.repo.save_promotion(&promotion).await?;
        tracing::info!(
            "Promotion {} finished as {}",
            promotion.id,
            promotion.state.as_str()
        );
        Ok(promotion)
    }

    fn transition(&self, promotion: &mut Promotion, next: PromotionState) -> Result<(), PromotionError> {
        if !promotion.state.can_transition_to(next) {
            return Err(PromotionError::InvalidTransition {
                id: promotion.id,
                from: promotion.state.as_str(),
                to: next.as_str(),
            });
        }
        promotion.state = next;
        Ok(())
    }

    async fn apply(
        &self,
        promotion: &mut Promotion,
        evaluated: &EvaluatedPreflight,
    ) -> Result<(), StoreError> {
        let target = &evaluated.target;
        self.create_missing_mappings(promotion.tenant_id, target, &evaluated.result.resolved_mappings)
            .await?;

        let target_keys = credential_key_map(self.credentials.as_ref(), promotion.tenant_id, target.id).await?;
        let target_links: HashMap<Uuid, String> = self
            .repo
            .list_runtime_links(target.id)
            .await?
            .into_iter()
            .map(|l| (l.canonical_workflow_id, l.runtime_workflow_id))
            .collect();
        let runtime = self.collaborators.runtime(target);

        for workflow_id in promotion.workflow_ids.clone() {
            let Some(source) = evaluated.workflows.get(&workflow_id) else {
                continue;
            };
            let result = self
                .apply_workflow(
                    runtime.as_ref(),
                    evaluated,
                    source,
                    target_links.get(&workflow_id).map(String::as_str),
                    &target_keys,
                )
                .await?;
            promotion.results.push(result);
            self.repo.save_promotion(promotion).await?;
        }
        Ok(())
    }

    /// Persist mappings the preflight matched by name, one writer per key and environment
    async fn create_missing_mappings(
        &self,
        tenant_id: Uuid,
        target: &Environment,
        resolved: &[ResolvedMapping],
    ) -> Result<(), StoreError> {
        let mut done = BTreeSet::new();
        for mapping in resolved.iter().filter(|m| m.auto_create) {
            if !done.insert(mapping.logical_key.as_str()) {
                continue;
            }
            let _guard = self.locks.lock(&mapping.logical_key, target.id).await;

            let logical = self
                .credentials
                .ensure_logical_credential(
                    tenant_id,
                    &mapping.logical_key,
                    logical_name(&mapping.logical_key),
                    &mapping.credential_type,
                )
                .await?;
            if self
                .credentials
                .get_mapping(tenant_id, logical.id, target.id)
                .await?
                .is_some()
            {
                continue;
            }

            let now = Utc::now();
            self.credentials
                .upsert_mapping(&CredentialMapping {
                    id: Uuid::new_v4(),
                    tenant_id,
                    logical_credential_id: logical.id,
                    environment_id: target.id,
                    physical_credential_id: mapping.target_physical_id.clone(),
                    physical_name: mapping.target_physical_name.clone(),
                    physical_type: mapping.credential_type.clone(),
                    created_at: now,
                    updated_at: Some(now),
                })
                .await?;
            tracing::info!(
                "Mapped {} to '{}' in {}",
                mapping.logical_key,
                mapping.target_physical_name,
                target.name
            );
        }
        Ok(())
    }

    async fn apply_workflow(
        &self,
        runtime: &dyn RuntimeClient,
        evaluated: &EvaluatedPreflight,
        source: &SourceWorkflow,
        existing_runtime_id: Option<&str>,
        target_keys: &CredentialKeyMap,
    ) -> Result<WorkflowPromotionResult, StoreError> {
        let canonical = &source.canonical;
        let target = &evaluated.target;
        let mut result = WorkflowPromotionResult {
            workflow_id: canonical.id,
            workflow_name: canonical.name.clone(),
            succeeded: false,
            runtime_workflow_id: None,
            applied_hash: None,
            error: None,
            warning: None,
        };

        let prepared = substitutions_for(canonical.id, source, evaluated)
            .and_then(|subs| Ok(substitute_credentials(&source.definition, &subs)?))
            .and_then(|definition| {
                let hash = content_hash(&definition, target_keys)?;
                Ok((definition, hash))
            });
        let (definition, hash) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                result.error = Some(e.to_string());
                return Ok(result);
            }
        };

        let deployed = match runtime.deploy_workflow(existing_runtime_id, &definition).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Deploying '{}' to {} failed: {}", canonical.name, target.name, e);
                result.error = Some(e.to_string());
                return Ok(result);
            }
        };
        result.runtime_workflow_id = Some(deployed.clone());

        // Linked before activation so a retry updates this copy instead of creating another
        self.repo
            .link_runtime_workflow(target.id, canonical.id, &deployed)
            .await?;

        if source.active() {
            if let Err(e) = runtime.activate_workflow(&deployed).await {
                tracing::warn!(
                    "Activating '{}' ({}) in {} failed: {}",
                    canonical.name,
                    deployed,
                    target.name,
                    e
                );
                result.error = Some(format!("Deployed as {}, but activation failed: {}", deployed, e));
                return Ok(result);
            }
        }
        self.repo
            .set_baseline(&BaselineUpdate {
                tenant_id: canonical.tenant_id,
                environment_id: target.id,
                canonical_workflow_id: canonical.id,
                hash: hash.clone(),
                git_configured: target.git_configured(),
                at: Utc::now(),
            })
            .await?;

        let mut updated = CanonicalWorkflow {
            content_hash: Some(hash.as_str().to_string()),
            updated_at: Some(Utc::now()),
            ..canonical.clone()
        };

        if let Some(git) = self.collaborators.git(target) {
            match commit_portable(git.as_ref(), target, canonical, &definition, target_keys).await {
                Ok(sha) => {
                    updated.git_commit_sha = Some(sha);
                    updated.git_path = target.git.as_ref().map(|g| g.workflow_path(canonical.id));
                }
                Err(e) => {
                    tracing::warn!("Git commit for '{}' in {} failed: {}", canonical.name, target.name, e);
                    result.warning = Some(format!("Deployed, but the git commit failed: {}", e));
                }
            }
        }
        self.repo.upsert_canonical_workflow(&updated).await?;

        result.succeeded = true;
        result.applied_hash = Some(hash);
        Ok(result)
    }
}

#[derive(Debug, Error)]
enum PrepareError {
    #[error("no resolved credential for '{0}'")]
    Unresolved(String),
    #[error(transparent)]
    Normalize(#[from] crate::identity::NormalizeError),
}

/// Substitutions for one workflow from the preflight's resolved mappings
fn substitutions_for(
    workflow_id: Uuid,
    source: &SourceWorkflow,
    evaluated: &EvaluatedPreflight,
) -> Result<CredentialSubstitutions, PrepareError> {
    let resolved: HashMap<(&str, &str), &ResolvedMapping> = evaluated
        .result
        .resolved_mappings
        .iter()
        .filter(|m| m.workflow_id == workflow_id)
        .map(|m| ((m.credential_type.as_str(), m.logical_key.as_str()), m))
        .collect();

    let mut substitutions = CredentialSubstitutions::new();
    for credential in credential_refs(&source.definition)? {
        let key = evaluated.source_keys.resolve(&credential);
        let mapping = resolved
            .get(&(credential.credential_type.as_str(), key.as_str()))
            .ok_or_else(|| PrepareError::Unresolved(key.clone()))?;
        substitutions.insert(
            (credential.credential_type.clone(), credential.source_key()),
            Substitution {
                physical_id: mapping.target_physical_id.clone(),
                physical_name: mapping.target_physical_name.clone(),
            },
        );
    }
    Ok(substitutions)
}

pub(crate) async fn commit_portable(
    git: &dyn GitProvider,
    environment: &Environment,
    canonical: &CanonicalWorkflow,
    definition: &serde_json::Value,
    keys: &CredentialKeyMap,
) -> Result<String, FetchError> {
    let Some(target) = environment.git.as_ref() else {
        return Err(FetchError::NotFound(format!(
            "environment {} has no repository",
            environment.name
        )));
    };
    let portable = portable_definition(definition, keys)?;
    let content = serde_json::to_string_pretty(&portable)
        .map_err(|e| FetchError::DataIntegrity(e.to_string()))?;
    git.commit_file(
        &target.workflow_path(canonical.id),
        &content,
        &format!("Update workflow '{}' in {}", canonical.name, environment.name),
        &target.branch,
    )
    .await
}

/// `"<workflow>: <key>, <key>; <workflow>: ..."` for every blocking issue
fn blocked_reason(evaluated: &EvaluatedPreflight) -> String {
    let mut by_workflow: Vec<(String, Vec<String>)> = Vec::new();
    for issue in &evaluated.result.blocking_issues {
        let detail = issue
            .logical_key
            .clone()
            .unwrap_or_else(|| issue.kind.as_str().to_string());
        match by_workflow.iter_mut().find(|(name, _)| *name == issue.workflow_name) {
            Some((_, details)) => details.push(detail),
            None => by_workflow.push((issue.workflow_name.clone(), vec![detail])),
        }
    }
    let parts: Vec<String> = by_workflow
        .into_iter()
        .map(|(name, details)| format!("{}: {}", name, details.join(", ")))
        .collect();
    format!("Preflight blocked: {}", parts.join("; "))
}
