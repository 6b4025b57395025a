//! Per-environment drift scans.
//!
//! A scan observes the runtime and the tracked Git ref, links runtime
//! workflows to canonical workflows, classifies every pair and commits the
//! environment's rows as one batch. Scans of different environments run
//! independently. Cancellation is observed up to the commit; the commit
//! itself always runs to completion.

use chrono::{DateTime, Utc};
use futures::{future, stream, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use flowops_shared::{
    CanonicalWorkflow, ContentHash, DriftStatus, Environment, EnvironmentWorkflowState,
    GitTarget, ScanReport,
};

use super::classifier::{classify, classify_environment, ClassifierInput};
use super::labels::status_display;
use super::status_view;
use crate::credentials::credential_key_map;
use crate::identity::{content_hash, CredentialKeyMap};
use crate::integrations::{
    CollaboratorFactory, FetchError, GitProvider, RuntimeClient, RuntimeWorkflowSummary,
};
use crate::store::{CredentialMappingStore, Repository, ScanCommit, StoreError};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan of environment {0} was cancelled")]
    Cancelled(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A runtime workflow and the outcome of hashing its definition
#[derive(Debug)]
struct Observed {
    summary: RuntimeWorkflowSummary,
    hash: Result<ContentHash, FetchError>,
}

#[derive(Debug)]
enum GitObservation {
    Absent,
    Present(ContentHash),
    Invalid(String),
}

/// Runtime workflows assigned to canonical workflows
#[derive(Debug, Default)]
struct Discovery {
    assigned: HashMap<Uuid, Observed>,
    new_links: Vec<(Uuid, String)>,
    new_workflows: Vec<CanonicalWorkflow>,
}

fn normalized_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Link each runtime workflow to a canonical workflow: existing link first,
/// then equal content hash, then equal name, else a new canonical workflow.
fn discover(
    mut observed: Vec<Observed>,
    links: &HashMap<String, Uuid>,
    canonicals: &[CanonicalWorkflow],
    tenant_id: Uuid,
    git: Option<&GitTarget>,
    now: DateTime<Utc>,
) -> Discovery {
    observed.sort_by(|a, b| a.summary.id.cmp(&b.summary.id));

    let mut claimed: HashSet<Uuid> = links.values().copied().collect();
    let mut discovery = Discovery::default();

    // Linked workflows first so they cannot be claimed by a name match
    let (linked, unlinked): (Vec<Observed>, Vec<Observed>) = observed
        .into_iter()
        .partition(|o| links.contains_key(&o.summary.id));

    for item in linked {
        if let Some(canonical_id) = links.get(&item.summary.id) {
            discovery.assigned.insert(*canonical_id, item);
        }
    }

    for item in unlinked {
        let by_hash = item.hash.as_ref().ok().and_then(|hash| {
            canonicals.iter().find(|c| {
                !claimed.contains(&c.id) && c.content_hash.as_deref() == Some(hash.as_str())
            })
        });
        let name = normalized_name(&item.summary.name);
        let matched = by_hash.or_else(|| {
            canonicals
                .iter()
                .find(|c| !claimed.contains(&c.id) && normalized_name(&c.name) == name)
        });

        let canonical_id = match matched {
            Some(canonical) => canonical.id,
            None => {
                let id = Uuid::new_v4();
                discovery.new_workflows.push(CanonicalWorkflow {
                    id,
                    tenant_id,
                    name: item.summary.name.clone(),
                    content_hash: item.hash.as_ref().ok().map(|h| h.to_string()),
                    git_path: git.map(|g| g.workflow_path(id)),
                    git_commit_sha: None,
                    created_at: now,
                    updated_at: None,
                });
                id
            }
        };

        claimed.insert(canonical_id);
        discovery
            .new_links
            .push((canonical_id, item.summary.id.clone()));
        discovery.assigned.insert(canonical_id, item);
    }

    discovery
}

/// Inputs for one row, gathered before classification
struct RowInput<'a> {
    previous: Option<&'a EnvironmentWorkflowState>,
    observed: Option<&'a Observed>,
    git: Option<&'a GitObservation>,
    runtime_failure: Option<&'a FetchError>,
    git_failure: Option<&'a FetchError>,
}

fn build_row(
    environment: &Environment,
    canonical_workflow_id: Uuid,
    input: RowInput<'_>,
    now: DateTime<Utc>,
    scan_started_at: DateTime<Utc>,
) -> EnvironmentWorkflowState {
    let previous = input.previous;
    let baseline_hash = previous.and_then(|p| p.baseline_hash.clone());
    let previous_runtime = previous.and_then(|p| p.runtime_hash.clone());

    let mut errors: Vec<String> = Vec::new();

    // Failed observations keep the last known hash
    let (runtime_hash, runtime_exists) = match (input.runtime_failure, input.observed) {
        (Some(e), _) => {
            errors.push(format!("runtime listing failed: {}", e));
            let exists = previous_runtime.is_some();
            (previous_runtime, exists)
        }
        (None, Some(observed)) => match &observed.hash {
            Ok(hash) => (Some(hash.clone()), true),
            Err(e) => {
                errors.push(format!("workflow '{}': {}", observed.summary.name, e));
                (previous_runtime, true)
            }
        },
        (None, None) => (None, false),
    };

    let git_hash = match (input.git_failure, input.git) {
        (Some(e), _) => {
            errors.push(format!("git unavailable: {}", e));
            previous.and_then(|p| p.git_hash.clone())
        }
        (None, Some(GitObservation::Present(hash))) => Some(hash.clone()),
        (None, Some(GitObservation::Invalid(message))) => {
            errors.push(format!("git definition invalid: {}", message));
            None
        }
        (None, Some(GitObservation::Absent)) | (None, None) => None,
    };

    let status = if input.git_failure.is_some() {
        DriftStatus::GitUnavailable
    } else if !errors.is_empty() {
        DriftStatus::Error
    } else {
        classify(&ClassifierInput {
            baseline_hash: baseline_hash.as_ref(),
            runtime_hash: runtime_hash.as_ref(),
            git_hash: git_hash.as_ref(),
            git_configured: environment.git_configured(),
            runtime_exists,
            class: environment.class,
        })
    };

    EnvironmentWorkflowState {
        tenant_id: environment.tenant_id,
        environment_id: environment.id,
        canonical_workflow_id,
        baseline_hash,
        runtime_hash,
        git_hash,
        git_configured: environment.git_configured(),
        status,
        error_message: (!errors.is_empty()).then(|| errors.join("; ")),
        scan_started_at,
        last_checked_at: now,
    }
}

async fn observe_runtime(
    runtime: &dyn RuntimeClient,
    summaries: Vec<RuntimeWorkflowSummary>,
    keys: &CredentialKeyMap,
    concurrency: usize,
) -> Vec<Observed> {
    stream::iter(summaries)
        .map(|summary| async move {
            let hash = match runtime.get_workflow(&summary.id).await {
                Ok(definition) => content_hash(&definition, keys).map_err(FetchError::from),
                Err(e) => Err(e),
            };
            Observed { summary, hash }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await
}

async fn observe_git_file(
    git: &dyn GitProvider,
    path: &str,
    head: &str,
    keys: &CredentialKeyMap,
) -> Result<GitObservation, FetchError> {
    let Some(content) = git.fetch_file(path, head).await? else {
        return Ok(GitObservation::Absent);
    };
    let definition: serde_json::Value = match serde_json::from_str(&content) {
        Ok(definition) => definition,
        Err(e) => return Ok(GitObservation::Invalid(e.to_string())),
    };
    Ok(match content_hash(&definition, keys) {
        Ok(hash) => GitObservation::Present(hash),
        Err(e) => GitObservation::Invalid(e.to_string()),
    })
}

/// Fetch every canonical workflow's file at `head`. Any fetch failure fails
/// the whole Git side of the scan.
async fn observe_git(
    git: &dyn GitProvider,
    target: &GitTarget,
    canonicals: &[CanonicalWorkflow],
    head: &str,
    keys: &CredentialKeyMap,
    concurrency: usize,
) -> Result<HashMap<Uuid, GitObservation>, FetchError> {
    let paths: Vec<(Uuid, String)> = canonicals
        .iter()
        .map(|canonical| {
            let path = canonical
                .git_path
                .clone()
                .unwrap_or_else(|| target.workflow_path(canonical.id));
            (canonical.id, path)
        })
        .collect();

    let results: Vec<(Uuid, Result<GitObservation, FetchError>)> = stream::iter(paths)
        .map(|(id, path)| async move { (id, observe_git_file(git, &path, head, keys).await) })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    results
        .into_iter()
        .map(|(id, result)| result.map(|observation| (id, observation)))
        .collect()
}

/// Collaborator calls are abandoned as soon as the scan is cancelled
async fn until_cancelled<F: Future>(
    token: &CancellationToken,
    environment_id: Uuid,
    work: F,
) -> Result<F::Output, ScanError> {
    tokio::select! {
        _ = token.cancelled() => Err(ScanError::Cancelled(environment_id)),
        output = work => Ok(output),
    }
}

pub struct EnvironmentScanner {
    repo: Arc<dyn Repository>,
    credentials: Arc<dyn CredentialMappingStore>,
    collaborators: Arc<dyn CollaboratorFactory>,
    concurrency: usize,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
}

/// Parent token shared by an environment's running scans
struct InFlight {
    token: CancellationToken,
    scans: usize,
}

/// Deregisters a scan when it finishes, however it finishes
struct ScanRegistration<'a> {
    in_flight: &'a Mutex<HashMap<Uuid, InFlight>>,
    environment_id: Uuid,
    parent: CancellationToken,
    token: CancellationToken,
}

impl Drop for ScanRegistration<'_> {
    fn drop(&mut self) {
        // A cancelled parent was already removed, possibly replaced by a newer scan's
        if self.parent.is_cancelled() {
            return;
        }
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = in_flight.get_mut(&self.environment_id) {
            entry.scans = entry.scans.saturating_sub(1);
            if entry.scans == 0 {
                in_flight.remove(&self.environment_id);
            }
        }
    }
}

impl EnvironmentScanner {
    pub fn new(
        repo: Arc<dyn Repository>,
        credentials: Arc<dyn CredentialMappingStore>,
        collaborators: Arc<dyn CollaboratorFactory>,
        concurrency: usize,
    ) -> Self {
        Self {
            repo,
            credentials,
            collaborators,
            concurrency: concurrency.max(1),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Token for a new scan; a child of the environment's token so that
    /// `cancel` reaches every scan in flight.
    fn register(&self, environment_id: Uuid) -> ScanRegistration<'_> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = in_flight.entry(environment_id).or_insert_with(|| InFlight {
            token: CancellationToken::new(),
            scans: 0,
        });
        entry.scans += 1;
        ScanRegistration {
            in_flight: &self.in_flight,
            environment_id,
            parent: entry.token.clone(),
            token: entry.token.child_token(),
        }
    }

    /// Cancel every in-flight scan of an environment. Returns whether a scan
    /// was running.
    pub fn cancel(&self, environment_id: Uuid) -> bool {
        let entry = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&environment_id);
        match entry {
            Some(InFlight { token, .. }) => {
                token.cancel();
                tracing::info!("Cancelled scans for environment {}", environment_id);
                true
            }
            None => false,
        }
    }

    /// Scan every environment of every tenant concurrently
    pub async fn scan_all(&self) -> Result<Vec<(Uuid, Result<ScanReport, ScanError>)>, ScanError> {
        let environments = self.repo.list_all_environments().await?;
        let scans = environments.iter().map(|environment| async move {
            (environment.id, self.scan_environment(environment).await)
        });
        Ok(future::join_all(scans).await)
    }

    #[instrument(skip(self, environment), fields(environment_id = %environment.id, class = environment.class.as_str()))]
    pub async fn scan_environment(&self, environment: &Environment) -> Result<ScanReport, ScanError> {
        let scan_started_at = Utc::now();
        let registration = self.register(environment.id);
        self.run(environment, scan_started_at, &registration.token).await
    }

    async fn run(
        &self,
        environment: &Environment,
        scan_started_at: DateTime<Utc>,
        token: &CancellationToken,
    ) -> Result<ScanReport, ScanError> {
        let keys =
            credential_key_map(self.credentials.as_ref(), environment.tenant_id, environment.id).await?;
        let runtime = self.collaborators.runtime(environment);
        let git = self.collaborators.git(environment);

        let head_request = async {
            match (&git, &environment.git) {
                (Some(provider), Some(target)) => Some(provider.resolve_ref(&target.branch).await),
                _ => None,
            }
        };
        let (listing, head) = until_cancelled(
            token,
            environment.id,
            future::join(runtime.list_workflows(), head_request),
        )
        .await?;

        let links: HashMap<String, Uuid> = self
            .repo
            .list_runtime_links(environment.id)
            .await?
            .into_iter()
            .map(|l| (l.runtime_workflow_id, l.canonical_workflow_id))
            .collect();
        let canonicals = self.repo.list_canonical_workflows(environment.tenant_id).await?;
        let previous: HashMap<Uuid, EnvironmentWorkflowState> = self
            .repo
            .list_workflow_states(environment.id)
            .await?
            .into_iter()
            .map(|s| (s.canonical_workflow_id, s))
            .collect();

        let (summaries, runtime_failure) = match listing {
            Ok(summaries) => (summaries, None),
            Err(e) => {
                tracing::warn!("Runtime listing failed for environment {}: {}", environment.name, e);
                (Vec::new(), Some(e))
            }
        };

        let (head, mut git_failure) = match head {
            Some(Ok(head)) => (Some(head), None),
            Some(Err(e)) => (None, Some(e)),
            None => (None, None),
        };

        let git_request = async {
            match (&git, &environment.git, &head) {
                (Some(provider), Some(target), Some(head)) => Some(
                    observe_git(
                        provider.as_ref(),
                        target,
                        &canonicals,
                        head,
                        &keys,
                        self.concurrency,
                    )
                    .await,
                ),
                _ => None,
            }
        };
        let (observed, git_files) = until_cancelled(
            token,
            environment.id,
            future::join(
                observe_runtime(runtime.as_ref(), summaries, &keys, self.concurrency),
                git_request,
            ),
        )
        .await?;

        let git_files = match git_files {
            Some(Ok(files)) => files,
            Some(Err(e)) => {
                git_failure = Some(e);
                HashMap::new()
            }
            None => HashMap::new(),
        };
        if let Some(e) = &git_failure {
            tracing::error!("Git unavailable for environment {}: {}", environment.name, e);
        }

        let now = Utc::now();
        let discovery = discover(
            observed,
            &links,
            &canonicals,
            environment.tenant_id,
            environment.git.as_ref(),
            now,
        );

        // Pairs with a runtime presence, a Git file, or an earlier row
        let mut in_scope: BTreeSet<Uuid> = discovery.assigned.keys().copied().collect();
        in_scope.extend(
            git_files
                .iter()
                .filter(|(_, o)| !matches!(o, GitObservation::Absent))
                .map(|(id, _)| *id),
        );
        in_scope.extend(previous.keys().copied());
        if runtime_failure.is_some() {
            in_scope.extend(links.values().copied());
        }

        let mut rows = Vec::with_capacity(in_scope.len());
        for canonical_id in &in_scope {
            let row = build_row(
                environment,
                *canonical_id,
                RowInput {
                    previous: previous.get(canonical_id),
                    observed: discovery.assigned.get(canonical_id),
                    git: git_files.get(canonical_id),
                    runtime_failure: runtime_failure.as_ref(),
                    git_failure: git_failure.as_ref(),
                },
                now,
                scan_started_at,
            );

            let before = previous.get(canonical_id).map(|p| p.status);
            match row.status {
                DriftStatus::Error => tracing::warn!(
                    "Workflow {} in environment {} errored: {}",
                    canonical_id,
                    environment.name,
                    row.error_message.as_deref().unwrap_or_default()
                ),
                status if before != Some(status) => tracing::info!(
                    "Workflow {} in environment {}: {} -> {}",
                    canonical_id,
                    environment.name,
                    before.map(|s| s.as_str()).unwrap_or("none"),
                    status
                ),
                _ => {}
            }
            rows.push(row);
        }

        if token.is_cancelled() {
            return Err(ScanError::Cancelled(environment.id));
        }

        let commit = ScanCommit {
            environment_id: environment.id,
            scan_started_at,
            new_workflows: discovery.new_workflows,
            new_links: discovery.new_links,
            rows,
        };
        let outcome = self.repo.commit_scan(&commit).await?;
        for workflow in &commit.new_workflows {
            if !outcome.superseded.contains(&workflow.id) {
                tracing::info!("Discovered workflow '{}' in environment {}", workflow.name, environment.name);
            }
        }
        if !outcome.superseded.is_empty() {
            tracing::info!(
                "{} workflows in environment {} were already linked by another scan",
                outcome.superseded.len(),
                environment.name
            );
        }
        if outcome.discarded > 0 {
            tracing::info!(
                "Discarded {} stale rows for environment {} (newer scan already stored)",
                outcome.discarded,
                environment.name
            );
        }
        let ScanCommit { new_workflows, mut rows, .. } = commit;
        rows.retain(|row| !outcome.superseded.contains(&row.canonical_workflow_id));

        let git_changed_paths = match (&git, &head) {
            (Some(provider), Some(head)) => self.git_changes(provider.as_ref(), environment, head).await,
            _ => Vec::new(),
        };

        let mut names: BTreeMap<Uuid, String> =
            canonicals.into_iter().map(|c| (c.id, c.name)).collect();
        names.extend(new_workflows.into_iter().map(|c| (c.id, c.name)));

        let statuses: Vec<DriftStatus> = rows.iter().map(|r| r.status).collect();
        let environment_status =
            classify_environment(environment.git_configured(), git_failure.is_some(), &statuses);
        let shown = status_display(environment_status, environment.class);

        Ok(ScanReport {
            environment_id: environment.id,
            environment_status,
            label: shown.label.to_string(),
            remediation_hint: shown.remediation_hint.to_string(),
            scan_started_at,
            completed_at: Utc::now(),
            git_head: head,
            git_changed_paths,
            workflows: rows
                .iter()
                .map(|row| {
                    status_view(
                        row,
                        names.get(&row.canonical_workflow_id).cloned(),
                        environment.class,
                    )
                })
                .collect(),
            discarded_stale: outcome.discarded,
        })
    }

    /// Paths changed since the previously scanned head; records the new head
    async fn git_changes(&self, git: &dyn GitProvider, environment: &Environment, head: &str) -> Vec<String> {
        if environment.last_git_head.as_deref() == Some(head) {
            return Vec::new();
        }

        let changed = match &environment.last_git_head {
            Some(since) => git.changed_files(since, head).await.unwrap_or_else(|e| {
                tracing::warn!("Could not list Git changes for {}: {}", environment.name, e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        if let Err(e) = self.repo.set_last_git_head(environment.id, head).await {
            tracing::warn!("Could not record Git head for {}: {}", environment.name, e);
        }
        changed
    }
}
