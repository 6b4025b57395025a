use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use crate::integrations::{
    CollaboratorFactory, FetchError, GitProvider, RuntimeClient, RuntimeCredential,
    RuntimeWorkflowSummary,
};
use flowops_shared::Environment;

// ============================================
// Fake runtime engine
// ============================================

#[derive(Default)]
struct RuntimeState {
    workflows: BTreeMap<String, Value>,
    credentials: Vec<RuntimeCredential>,
    workflow_errors: HashMap<String, FetchError>,
    list_error: Option<FetchError>,
    list_delay: Option<Duration>,
    deploy_error: Option<FetchError>,
    deploy_errors_by_name: HashMap<String, FetchError>,
    activation_errors: Vec<FetchError>,
    next_id: u32,
    deployed: Vec<(Option<String>, Value)>,
    activated: Vec<String>,
    credential_lists: u32,
}

/// In-process runtime engine holding workflow definitions by runtime id
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    fn with<T>(&self, f: impl FnOnce(&mut RuntimeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn put_workflow(&self, id: &str, definition: Value) {
        self.with(|s| s.workflows.insert(id.to_string(), definition));
    }

    pub fn remove_workflow(&self, id: &str) {
        self.with(|s| s.workflows.remove(id));
    }

    pub fn workflow(&self, id: &str) -> Option<Value> {
        self.with(|s| s.workflows.get(id).cloned())
    }

    pub fn add_credential(&self, credential_type: &str, id: &str, name: &str) {
        self.with(|s| {
            s.credentials.push(RuntimeCredential {
                id: id.to_string(),
                name: name.to_string(),
                credential_type: credential_type.to_string(),
            })
        });
    }

    pub fn fail_workflow(&self, id: &str, error: FetchError) {
        self.with(|s| s.workflow_errors.insert(id.to_string(), error));
    }

    pub fn fail_listing(&self, error: FetchError) {
        self.with(|s| s.list_error = Some(error));
    }

    pub fn delay_listing(&self, delay: Duration) {
        self.with(|s| s.list_delay = Some(delay));
    }

    pub fn fail_deploys(&self, error: FetchError) {
        self.with(|s| s.deploy_error = Some(error));
    }

    /// Fail deploys of the workflow with this name only
    pub fn fail_deploys_of(&self, name: &str, error: FetchError) {
        self.with(|s| s.deploy_errors_by_name.insert(name.to_string(), error));
    }

    /// Fail the next activation call once
    pub fn fail_next_activation(&self, error: FetchError) {
        self.with(|s| s.activation_errors.push(error));
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        self.with(|s| s.workflows.keys().cloned().collect())
    }

    pub fn deployed(&self) -> Vec<(Option<String>, Value)> {
        self.with(|s| s.deployed.clone())
    }

    pub fn activated(&self) -> Vec<String> {
        self.with(|s| s.activated.clone())
    }

    pub fn credential_lists(&self) -> u32 {
        self.with(|s| s.credential_lists)
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn list_workflows(&self) -> Result<Vec<RuntimeWorkflowSummary>, FetchError> {
        let delay = self.with(|s| s.list_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            if let Some(e) = &s.list_error {
                return Err(e.clone());
            }
            Ok(s.workflows
                .iter()
                .map(|(id, definition)| RuntimeWorkflowSummary {
                    id: id.clone(),
                    name: definition["name"].as_str().unwrap_or_default().to_string(),
                    active: definition["active"].as_bool().unwrap_or(false),
                })
                .collect())
        })
    }

    async fn get_workflow(&self, id: &str) -> Result<Value, FetchError> {
        self.with(|s| {
            if let Some(e) = s.workflow_errors.get(id) {
                return Err(e.clone());
            }
            s.workflows
                .get(id)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(format!("workflow {}", id)))
        })
    }

    async fn list_credentials(&self, credential_type: &str) -> Result<Vec<RuntimeCredential>, FetchError> {
        self.with(|s| {
            s.credential_lists += 1;
            Ok(s.credentials
                .iter()
                .filter(|c| c.credential_type == credential_type)
                .cloned()
                .collect())
        })
    }

    async fn deploy_workflow(&self, existing_id: Option<&str>, definition: &Value) -> Result<String, FetchError> {
        self.with(|s| {
            if let Some(e) = &s.deploy_error {
                return Err(e.clone());
            }
            let name = definition["name"].as_str().unwrap_or_default();
            if let Some(e) = s.deploy_errors_by_name.get(name) {
                return Err(e.clone());
            }
            let id = match existing_id {
                Some(id) => id.to_string(),
                None => {
                    s.next_id += 1;
                    format!("deployed-{}", s.next_id)
                }
            };
            let mut stored = definition.clone();
            stored["id"] = Value::String(id.clone());
            s.workflows.insert(id.clone(), stored);
            s.deployed.push((existing_id.map(str::to_string), definition.clone()));
            Ok(id)
        })
    }

    async fn activate_workflow(&self, id: &str) -> Result<(), FetchError> {
        self.with(|s| {
            if !s.activation_errors.is_empty() {
                return Err(s.activation_errors.remove(0));
            }
            if let Some(workflow) = s.workflows.get_mut(id) {
                workflow["active"] = Value::Bool(true);
            }
            s.activated.push(id.to_string());
            Ok(())
        })
    }
}

// ============================================
// Fake Git hosting
// ============================================

#[derive(Default)]
struct GitState {
    head: String,
    files: HashMap<String, String>,
    resolve_error: Option<FetchError>,
    commit_error: Option<FetchError>,
    changed: Vec<String>,
    commits: Vec<(String, String)>,
}

/// In-process repository with a single moving branch head
pub struct FakeGit {
    state: Mutex<GitState>,
}

impl Default for FakeGit {
    fn default() -> Self {
        Self {
            state: Mutex::new(GitState {
                head: "c0ffee0".to_string(),
                ..GitState::default()
            }),
        }
    }
}

impl FakeGit {
    fn with<T>(&self, f: impl FnOnce(&mut GitState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn put_file(&self, path: &str, definition: &Value) {
        let content = serde_json::to_string_pretty(definition).unwrap();
        self.with(|s| s.files.insert(path.to_string(), content));
    }

    pub fn file(&self, path: &str) -> Option<Value> {
        self.with(|s| s.files.get(path).map(|c| serde_json::from_str(c).unwrap()))
    }

    pub fn set_head(&self, head: &str, changed: &[&str]) {
        self.with(|s| {
            s.head = head.to_string();
            s.changed = changed.iter().map(|p| p.to_string()).collect();
        });
    }

    pub fn fail_resolve(&self, error: FetchError) {
        self.with(|s| s.resolve_error = Some(error));
    }

    pub fn fail_commits(&self, error: FetchError) {
        self.with(|s| s.commit_error = Some(error));
    }

    pub fn commits(&self) -> Vec<(String, String)> {
        self.with(|s| s.commits.clone())
    }
}

#[async_trait]
impl GitProvider for FakeGit {
    async fn resolve_ref(&self, _reference: &str) -> Result<String, FetchError> {
        self.with(|s| match &s.resolve_error {
            Some(e) => Err(e.clone()),
            None => Ok(s.head.clone()),
        })
    }

    async fn fetch_file(&self, path: &str, _reference: &str) -> Result<Option<String>, FetchError> {
        self.with(|s| Ok(s.files.get(path).cloned()))
    }

    async fn changed_files(&self, _since: &str, _reference: &str) -> Result<Vec<String>, FetchError> {
        self.with(|s| Ok(s.changed.clone()))
    }

    async fn commit_file(
        &self,
        path: &str,
        content: &str,
        _message: &str,
        _branch: &str,
    ) -> Result<String, FetchError> {
        self.with(|s| {
            if let Some(e) = &s.commit_error {
                return Err(e.clone());
            }
            s.files.insert(path.to_string(), content.to_string());
            s.commits.push((path.to_string(), content.to_string()));
            s.head = format!("commit-{}", s.commits.len());
            Ok(s.head.clone())
        })
    }
}

// ============================================
// Collaborator factory
// ============================================

/// Hands out one fake runtime and one fake repository per environment
#[derive(Default)]
pub struct FakeCollaborators {
    runtimes: Mutex<HashMap<Uuid, Arc<FakeRuntime>>>,
    gits: Mutex<HashMap<Uuid, Arc<FakeGit>>>,
}

impl FakeCollaborators {
    pub fn runtime_for(&self, environment_id: Uuid) -> Arc<FakeRuntime> {
        self.runtimes
            .lock()
            .unwrap()
            .entry(environment_id)
            .or_default()
            .clone()
    }

    pub fn git_for(&self, environment_id: Uuid) -> Arc<FakeGit> {
        self.gits
            .lock()
            .unwrap()
            .entry(environment_id)
            .or_default()
            .clone()
    }
}

impl CollaboratorFactory for FakeCollaborators {
    fn runtime(&self, environment: &Environment) -> Arc<dyn RuntimeClient> {
        self.runtime_for(environment.id)
    }

    fn git(&self, environment: &Environment) -> Option<Arc<dyn GitProvider>> {
        environment
            .git
            .as_ref()
            .map(|_| self.git_for(environment.id) as Arc<dyn GitProvider>)
    }
}

// ============================================
// HTTP helpers
// ============================================

pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    tenant_id: Option<Uuid>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(tenant_id) = tenant_id {
        request = request.header("X-Tenant-Id", tenant_id.to_string());
    }
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}
