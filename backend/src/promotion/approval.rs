use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use flowops_shared::{CanonicalWorkflow, EnvironmentWorkflowState};

use super::orchestrator::commit_portable;
use crate::credentials::credential_key_map;
use crate::integrations::CollaboratorFactory;
use crate::store::{BaselineUpdate, CredentialMappingStore, Repository, StoreError};

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("environment {0} not found")]
    EnvironmentNotFound(Uuid),

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("workflow '{0}' has not been observed at runtime in this environment")]
    NotAtRuntime(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct Approval {
    pub state: EnvironmentWorkflowState,
    pub git_commit_sha: Option<String>,
    pub warning: Option<String>,
}

/// Accepts the last observed runtime version of a workflow as its baseline
pub struct BaselineApprover {
    repo: Arc<dyn Repository>,
    credentials: Arc<dyn CredentialMappingStore>,
    collaborators: Arc<dyn CollaboratorFactory>,
}

impl BaselineApprover {
    pub fn new(
        repo: Arc<dyn Repository>,
        credentials: Arc<dyn CredentialMappingStore>,
        collaborators: Arc<dyn CollaboratorFactory>,
    ) -> Self {
        Self {
            repo,
            credentials,
            collaborators,
        }
    }

    #[instrument(skip(self))]
    pub async fn approve(
        &self,
        tenant_id: Uuid,
        environment_id: Uuid,
        workflow_id: Uuid,
    ) -> Result<Approval, ApprovalError> {
        let environment = self
            .repo
            .get_environment(tenant_id, environment_id)
            .await?
            .ok_or(ApprovalError::EnvironmentNotFound(environment_id))?;
        let canonical = self
            .repo
            .get_canonical_workflow(tenant_id, workflow_id)
            .await?
            .ok_or(ApprovalError::WorkflowNotFound(workflow_id))?;

        let runtime_hash = self
            .repo
            .get_workflow_state(environment.id, workflow_id)
            .await?
            .and_then(|state| state.runtime_hash)
            .ok_or_else(|| ApprovalError::NotAtRuntime(canonical.name.clone()))?;

        let state = self
            .repo
            .set_baseline(&BaselineUpdate {
                tenant_id,
                environment_id: environment.id,
                canonical_workflow_id: workflow_id,
                hash: runtime_hash.clone(),
                git_configured: environment.git_configured(),
                at: Utc::now(),
            })
            .await?;
        tracing::info!(
            "Approved '{}' in {} at {}",
            canonical.name,
            environment.name,
            runtime_hash
        );

        let mut approval = Approval {
            state,
            git_commit_sha: None,
            warning: None,
        };
        if !environment.class.is_dev() {
            return Ok(approval);
        }
        let Some(git) = self.collaborators.git(&environment) else {
            return Ok(approval);
        };

        // Dev runtime is the authoring surface, so the approved version goes to git
        let runtime_id = self
            .repo
            .list_runtime_links(environment.id)
            .await?
            .into_iter()
            .find(|l| l.canonical_workflow_id == workflow_id)
            .map(|l| l.runtime_workflow_id);
        let Some(runtime_id) = runtime_id else {
            approval.warning = Some("Baseline approved, but no runtime workflow is linked".to_string());
            return Ok(approval);
        };

        let keys = credential_key_map(self.credentials.as_ref(), tenant_id, environment.id).await?;
        let runtime = self.collaborators.runtime(&environment);
        let committed = match runtime.get_workflow(&runtime_id).await {
            Ok(definition) => {
                commit_portable(git.as_ref(), &environment, &canonical, &definition, &keys).await
            }
            Err(e) => Err(e),
        };

        match committed {
            Ok(sha) => {
                self.repo
                    .upsert_canonical_workflow(&CanonicalWorkflow {
                        content_hash: Some(runtime_hash.as_str().to_string()),
                        git_path: environment.git.as_ref().map(|g| g.workflow_path(workflow_id)),
                        git_commit_sha: Some(sha.clone()),
                        updated_at: Some(Utc::now()),
                        ..canonical
                    })
                    .await?;
                approval.git_commit_sha = Some(sha);
            }
            Err(e) => {
                tracing::warn!("Git commit for '{}' in {} failed: {}", canonical.name, environment.name, e);
                approval.warning = Some(format!("Baseline approved, but the git commit failed: {}", e));
            }
        }
        Ok(approval)
    }
}
