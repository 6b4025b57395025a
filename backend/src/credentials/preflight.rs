//! Credential preflight for promotions.
//!
//! Read-only: computes what a promotion would need in the target environment
//! and reports every credential that cannot be resolved there.

use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use flowops_shared::{
    CanonicalWorkflow, Environment, PreflightIssue, PreflightIssueKind, PreflightResult,
    ResolvedMapping,
};

use super::{credential_key_map, logical_name};
use crate::identity::{credential_refs, CredentialKeyMap, CredentialRef};
use crate::integrations::{CollaboratorFactory, FetchError, RuntimeClient, RuntimeCredential};
use crate::store::{CredentialMappingStore, Repository, StoreError};

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("environment {0} not found")]
    EnvironmentNotFound(Uuid),

    #[error("source and target environment must differ")]
    SameEnvironment,

    #[error("target runtime credentials unavailable: {0}")]
    TargetRuntime(FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A workflow as loaded from the source runtime
#[derive(Debug, Clone)]
pub struct SourceWorkflow {
    pub canonical: CanonicalWorkflow,
    pub runtime_workflow_id: String,
    pub definition: Value,
}

impl SourceWorkflow {
    pub fn active(&self) -> bool {
        self.definition
            .get("active")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Preflight report plus what the orchestrator needs to apply it
pub struct EvaluatedPreflight {
    pub result: PreflightResult,
    pub source: Environment,
    pub target: Environment,
    pub source_keys: CredentialKeyMap,
    pub workflows: BTreeMap<Uuid, SourceWorkflow>,
}

struct Findings {
    blocking: Vec<PreflightIssue>,
    warnings: Vec<PreflightIssue>,
    resolved: Vec<ResolvedMapping>,
}

impl Findings {
    fn issue(
        &mut self,
        kind: PreflightIssueKind,
        workflow_id: Uuid,
        workflow_name: &str,
        logical_key: Option<&str>,
        blocking: bool,
        message: String,
    ) {
        let issue = PreflightIssue {
            kind,
            workflow_id,
            workflow_name: workflow_name.to_string(),
            logical_key: logical_key.map(str::to_string),
            blocking,
            message,
        };
        if blocking {
            self.blocking.push(issue);
        } else {
            self.warnings.push(issue);
        }
    }
}

/// Target runtime credential lists, fetched once per type
struct TargetCredentials<'a> {
    runtime: &'a dyn RuntimeClient,
    by_type: HashMap<String, Vec<RuntimeCredential>>,
}

impl<'a> TargetCredentials<'a> {
    async fn of_type(&mut self, credential_type: &str) -> Result<&[RuntimeCredential], PreflightError> {
        if !self.by_type.contains_key(credential_type) {
            let credentials = self
                .runtime
                .list_credentials(credential_type)
                .await
                .map_err(PreflightError::TargetRuntime)?;
            self.by_type.insert(credential_type.to_string(), credentials);
        }
        Ok(self
            .by_type
            .get(credential_type)
            .map(Vec::as_slice)
            .unwrap_or_default())
    }
}

pub struct PreflightResolver {
    repo: Arc<dyn Repository>,
    credentials: Arc<dyn CredentialMappingStore>,
    collaborators: Arc<dyn CollaboratorFactory>,
    block_on_missing_logical: bool,
}

impl PreflightResolver {
    pub fn new(
        repo: Arc<dyn Repository>,
        credentials: Arc<dyn CredentialMappingStore>,
        collaborators: Arc<dyn CollaboratorFactory>,
        block_on_missing_logical: bool,
    ) -> Self {
        Self {
            repo,
            credentials,
            collaborators,
            block_on_missing_logical,
        }
    }

    pub async fn preflight(
        &self,
        tenant_id: Uuid,
        workflow_ids: &[Uuid],
        source_environment_id: Uuid,
        target_environment_id: Uuid,
    ) -> Result<PreflightResult, PreflightError> {
        self.evaluate(tenant_id, workflow_ids, source_environment_id, target_environment_id)
            .await
            .map(|evaluated| evaluated.result)
    }

    async fn environment(&self, tenant_id: Uuid, id: Uuid) -> Result<Environment, PreflightError> {
        self.repo
            .get_environment(tenant_id, id)
            .await?
            .ok_or(PreflightError::EnvironmentNotFound(id))
    }

    #[instrument(skip(self, workflow_ids), fields(workflows = workflow_ids.len()))]
    pub async fn evaluate(
        &self,
        tenant_id: Uuid,
        workflow_ids: &[Uuid],
        source_environment_id: Uuid,
        target_environment_id: Uuid,
    ) -> Result<EvaluatedPreflight, PreflightError> {
        if source_environment_id == target_environment_id {
            return Err(PreflightError::SameEnvironment);
        }
        let source = self.environment(tenant_id, source_environment_id).await?;
        let target = self.environment(tenant_id, target_environment_id).await?;

        let source_runtime = self.collaborators.runtime(&source);
        let target_runtime = self.collaborators.runtime(&target);
        let source_keys = credential_key_map(self.credentials.as_ref(), tenant_id, source.id).await?;
        let source_links: HashMap<Uuid, String> = self
            .repo
            .list_runtime_links(source.id)
            .await?
            .into_iter()
            .map(|l| (l.canonical_workflow_id, l.runtime_workflow_id))
            .collect();

        let mut findings = Findings {
            blocking: Vec::new(),
            warnings: Vec::new(),
            resolved: Vec::new(),
        };
        let mut target_credentials = TargetCredentials {
            runtime: target_runtime.as_ref(),
            by_type: HashMap::new(),
        };
        let mut workflows = BTreeMap::new();
        let mut seen = HashSet::new();

        for &workflow_id in workflow_ids {
            if !seen.insert(workflow_id) {
                continue;
            }

            let canonical = self.repo.get_canonical_workflow(tenant_id, workflow_id).await?;
            let name = canonical
                .as_ref()
                .map(|c| c.name.clone())
                .unwrap_or_else(|| workflow_id.to_string());

            let (canonical, runtime_id) = match (canonical, source_links.get(&workflow_id)) {
                (Some(canonical), Some(runtime_id)) => (canonical, runtime_id.clone()),
                _ => {
                    findings.issue(
                        PreflightIssueKind::WorkflowNotFound,
                        workflow_id,
                        &name,
                        None,
                        true,
                        format!("Workflow '{}' is not present in environment '{}'", name, source.name),
                    );
                    continue;
                }
            };

            let loaded = source_runtime.get_workflow(&runtime_id).await.and_then(|definition| {
                credential_refs(&definition)
                    .map(|refs| (definition, refs))
                    .map_err(FetchError::from)
            });
            let (definition, refs) = match loaded {
                Ok(loaded) => loaded,
                Err(e) => {
                    findings.issue(
                        PreflightIssueKind::WorkflowNotFound,
                        workflow_id,
                        &name,
                        None,
                        true,
                        format!(
                            "Workflow '{}' could not be loaded from environment '{}': {}",
                            name, source.name, e
                        ),
                    );
                    continue;
                }
            };

            // One entry per distinct credential, however many nodes use it
            let mut references: BTreeMap<(String, String), CredentialRef> = BTreeMap::new();
            for credential in refs {
                references
                    .entry((credential.credential_type.clone(), source_keys.resolve(&credential)))
                    .or_insert(credential);
            }

            for ((credential_type, key), credential) in &references {
                self.resolve_credential(
                    tenant_id,
                    &target,
                    workflow_id,
                    &name,
                    credential_type,
                    key,
                    credential,
                    &mut target_credentials,
                    &mut findings,
                )
                .await?;
            }

            workflows.insert(
                workflow_id,
                SourceWorkflow {
                    canonical,
                    runtime_workflow_id: runtime_id,
                    definition,
                },
            );
        }

        tracing::info!(
            "Preflight {} -> {}: {} blocking, {} warnings, {} resolved",
            source.name,
            target.name,
            findings.blocking.len(),
            findings.warnings.len(),
            findings.resolved.len()
        );

        Ok(EvaluatedPreflight {
            result: PreflightResult {
                source_environment_id: source.id,
                target_environment_id: target.id,
                blocking_issues: findings.blocking,
                warnings: findings.warnings,
                resolved_mappings: findings.resolved,
                checked_at: Utc::now(),
            },
            source,
            target,
            source_keys,
            workflows,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_credential(
        &self,
        tenant_id: Uuid,
        target: &Environment,
        workflow_id: Uuid,
        workflow_name: &str,
        credential_type: &str,
        key: &str,
        credential: &CredentialRef,
        target_credentials: &mut TargetCredentials<'_>,
        findings: &mut Findings,
    ) -> Result<(), PreflightError> {
        let Some(logical) = self.credentials.find_logical_credential(tenant_id, key).await? else {
            findings.issue(
                PreflightIssueKind::NoLogicalCredential,
                workflow_id,
                workflow_name,
                Some(key),
                self.block_on_missing_logical,
                format!(
                    "Workflow '{}' uses credential '{}' which has no logical credential yet",
                    workflow_name, key
                ),
            );
            if self.block_on_missing_logical {
                return Ok(());
            }

            // Auto-create needs a same-named credential of the same type in the target
            let wanted = if credential.physical_name.is_empty() {
                logical_name(key)
            } else {
                credential.physical_name.as_str()
            };
            let candidate = target_credentials
                .of_type(credential_type)
                .await?
                .iter()
                .find(|c| c.name == wanted)
                .cloned();

            match candidate {
                Some(found) => findings.resolved.push(ResolvedMapping {
                    workflow_id,
                    logical_key: key.to_string(),
                    credential_type: credential_type.to_string(),
                    source_physical_id: credential.physical_id.clone(),
                    source_physical_name: credential.physical_name.clone(),
                    target_physical_id: found.id,
                    target_physical_name: found.name,
                    auto_create: true,
                }),
                None => findings.issue(
                    PreflightIssueKind::MissingMapping,
                    workflow_id,
                    workflow_name,
                    Some(key),
                    true,
                    format!(
                        "Workflow '{}' needs credential '{}' but environment '{}' has no '{}' credential named '{}'",
                        workflow_name, key, target.name, credential_type, wanted
                    ),
                ),
            }
            return Ok(());
        };

        let Some(mapping) = self
            .credentials
            .get_mapping(tenant_id, logical.id, target.id)
            .await?
        else {
            findings.issue(
                PreflightIssueKind::MissingMapping,
                workflow_id,
                workflow_name,
                Some(key),
                true,
                format!(
                    "Workflow '{}' needs credential '{}' but it is not mapped in environment '{}'",
                    workflow_name, key, target.name
                ),
            );
            return Ok(());
        };

        let present = target_credentials
            .of_type(&mapping.physical_type)
            .await?
            .iter()
            .any(|c| c.id == mapping.physical_credential_id);
        if !present {
            findings.issue(
                PreflightIssueKind::MappedMissingInTarget,
                workflow_id,
                workflow_name,
                Some(key),
                true,
                format!(
                    "Workflow '{}' needs credential '{}', mapped to '{}' ({}) which no longer exists in environment '{}'",
                    workflow_name, key, mapping.physical_name, mapping.physical_credential_id, target.name
                ),
            );
            return Ok(());
        }

        findings.resolved.push(ResolvedMapping {
            workflow_id,
            logical_key: key.to_string(),
            credential_type: credential_type.to_string(),
            source_physical_id: credential.physical_id.clone(),
            source_physical_name: credential.physical_name.clone(),
            target_physical_id: mapping.physical_credential_id,
            target_physical_name: mapping.physical_name,
            auto_create: false,
        });
        Ok(())
    }
}
