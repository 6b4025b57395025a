//! Clients for the external collaborators: the workflow runtime engine and
//! the Git hosting backend.

pub mod git;
pub mod runtime;

pub use git::GitHubProvider;
pub use runtime::HttpRuntimeClient;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::identity::NormalizeError;
use flowops_shared::Environment;

/// Collaborator failure, classified by how the caller must react
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    /// Network failure, timeout, 408/429/5xx; retried with backoff
    #[error("transient failure: {0}")]
    Transient(String),

    /// Credentials rejected or an auth wall answered instead of the API
    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Payload cannot be decoded or normalized, or the request was rejected as invalid
    #[error("data integrity: {0}")]
    DataIntegrity(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::DataIntegrity(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}

impl From<NormalizeError> for FetchError {
    fn from(err: NormalizeError) -> Self {
        Self::DataIntegrity(err.to_string())
    }
}

static HTML_DOCUMENT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)<!doctype\s+html|<html[\s>]").ok());

static LOGIN_CUES: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)type\s*=\s*["']?password|name\s*=\s*["']?(login|username)|sign[\s-]?in|log[\s-]?in|single sign-on"#,
    )
    .ok()
});

/// An HTML login page served where JSON was expected (SSO proxy, expired session)
pub fn looks_like_auth_wall(body: &str) -> bool {
    let (Some(html), Some(login)) = (HTML_DOCUMENT.as_ref(), LOGIN_CUES.as_ref()) else {
        return false;
    };
    html.is_match(body) && login.is_match(body)
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Map a collaborator response to the error taxonomy. `Ok(())` means usable.
pub fn classify_response(status: StatusCode, body: &str) -> Result<(), FetchError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(FetchError::Authorization(format!("HTTP {}", status.as_u16())));
    }
    if looks_like_auth_wall(body) {
        return Err(FetchError::Authorization(format!(
            "HTTP {} returned a login page",
            status.as_u16()
        )));
    }
    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound(snippet(body)));
    }
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        return Err(FetchError::Transient(format!(
            "HTTP {}: {}",
            status.as_u16(),
            snippet(body)
        )));
    }
    if !status.is_success() {
        return Err(FetchError::DataIntegrity(format!(
            "HTTP {}: {}",
            status.as_u16(),
            snippet(body)
        )));
    }
    Ok(())
}

/// Read a response body, classify it and decode it as JSON
pub(crate) async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, FetchError> {
    let status = response.status();
    let body = response.text().await?;
    classify_response(status, &body)?;
    serde_json::from_str(&body).map_err(|e| FetchError::DataIntegrity(e.to_string()))
}

/// Per-call timeout and backoff for one collaborator
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_millis(250),
        }
    }
}

/// Run `call` under the policy: each attempt is bounded by the timeout and
/// only `Transient` failures are retried.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        let result = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Transient(format!(
                "{} timed out after {}s",
                operation,
                policy.timeout.as_secs_f32()
            ))),
        };

        match result {
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                tracing::debug!(
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    operation,
                    attempt,
                    policy.max_retries,
                    backoff.as_millis(),
                    e
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            other => return other,
        }
    }
}

/// Workflow as listed by the runtime, without its definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeWorkflowSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub active: bool,
}

/// Credential stored in one runtime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeCredential {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub credential_type: String,
}

#[async_trait]
pub trait RuntimeClient: Send + Sync {
    async fn list_workflows(&self) -> Result<Vec<RuntimeWorkflowSummary>, FetchError>;
    async fn get_workflow(&self, id: &str) -> Result<serde_json::Value, FetchError>;
    async fn list_credentials(&self, credential_type: &str) -> Result<Vec<RuntimeCredential>, FetchError>;
    /// Update `existing_id` when given, create otherwise. Returns the runtime id.
    async fn deploy_workflow(
        &self,
        existing_id: Option<&str>,
        definition: &serde_json::Value,
    ) -> Result<String, FetchError>;
    async fn activate_workflow(&self, id: &str) -> Result<(), FetchError>;
}

#[async_trait]
pub trait GitProvider: Send + Sync {
    /// Commit sha the ref currently points at
    async fn resolve_ref(&self, reference: &str) -> Result<String, FetchError>;
    /// `Ok(None)` when the file does not exist at the ref
    async fn fetch_file(&self, path: &str, reference: &str) -> Result<Option<String>, FetchError>;
    async fn changed_files(&self, since: &str, reference: &str) -> Result<Vec<String>, FetchError>;
    /// Returns the sha of the new commit
    async fn commit_file(
        &self,
        path: &str,
        content: &str,
        message: &str,
        branch: &str,
    ) -> Result<String, FetchError>;
}

/// Builds collaborator clients for an environment
pub trait CollaboratorFactory: Send + Sync {
    fn runtime(&self, environment: &Environment) -> Arc<dyn RuntimeClient>;
    /// `None` when the environment tracks no repository
    fn git(&self, environment: &Environment) -> Option<Arc<dyn GitProvider>>;
}

/// HTTP clients sharing one connection pool
pub struct HttpCollaborators {
    http: reqwest::Client,
    runtime_policy: RetryPolicy,
    git_policy: RetryPolicy,
    git_api_base_url: String,
    runtime_api_key_header: String,
}

impl HttpCollaborators {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("flowops/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            runtime_policy: RetryPolicy {
                timeout: Duration::from_secs(config.runtime_timeout_secs),
                max_retries: config.fetch_max_retries,
                initial_backoff: Duration::from_millis(config.fetch_backoff_ms),
            },
            git_policy: RetryPolicy {
                timeout: Duration::from_secs(config.git_timeout_secs),
                max_retries: config.fetch_max_retries,
                initial_backoff: Duration::from_millis(config.fetch_backoff_ms),
            },
            git_api_base_url: config.git_api_base_url.clone(),
            runtime_api_key_header: config.runtime_api_key_header.clone(),
        })
    }
}

impl CollaboratorFactory for HttpCollaborators {
    fn runtime(&self, environment: &Environment) -> Arc<dyn RuntimeClient> {
        Arc::new(HttpRuntimeClient::new(
            self.http.clone(),
            &environment.runtime_base_url,
            &self.runtime_api_key_header,
            &environment.runtime_api_key,
            self.runtime_policy,
        ))
    }

    fn git(&self, environment: &Environment) -> Option<Arc<dyn GitProvider>> {
        environment.git.as_ref().map(|target| {
            Arc::new(GitHubProvider::new(
                self.http.clone(),
                &self.git_api_base_url,
                target,
                self.git_policy,
            )) as Arc<dyn GitProvider>
        })
    }
}
