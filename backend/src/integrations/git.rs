use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::json;

use super::{read_json, with_retry, FetchError, GitProvider, RetryPolicy};
use flowops_shared::GitTarget;

#[derive(Debug, Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct FileContent {
    sha: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
}

#[derive(Debug, Deserialize)]
struct ChangedFile {
    filename: String,
}

#[derive(Debug, Deserialize)]
struct Comparison {
    #[serde(default)]
    files: Vec<ChangedFile>,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    commit: CommitRef,
}

/// GitHub REST contents/commits API for one repository
pub struct GitHubProvider {
    http: reqwest::Client,
    api_base_url: String,
    repository: String,
    token: String,
    policy: RetryPolicy,
}

impl GitHubProvider {
    pub fn new(http: reqwest::Client, api_base_url: &str, target: &GitTarget, policy: RetryPolicy) -> Self {
        Self {
            http,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            repository: target.repository.trim_matches('/').to_string(),
            token: target.token.clone(),
            policy,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .http
            .request(
                method,
                format!("{}/repos/{}{}", self.api_base_url, self.repository, path),
            )
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");

        if self.token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.token)
        }
    }

    async fn get_file(&self, path: &str, reference: &str) -> Result<Option<FileContent>, FetchError> {
        let url_path = format!("/contents/{}", path.trim_start_matches('/'));
        let result: Result<FileContent, FetchError> = with_retry(&self.policy, "fetch_file", || {
            let request = self
                .request(reqwest::Method::GET, &url_path)
                .query(&[("ref", reference)]);
            async move { read_json(request.send().await?).await }
        })
        .await;

        match result {
            Ok(file) => Ok(Some(file)),
            Err(FetchError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn decode_content(file: &FileContent) -> Result<String, FetchError> {
    if file.encoding != "base64" {
        return Err(FetchError::DataIntegrity(format!(
            "unsupported content encoding '{}'",
            file.encoding
        )));
    }
    // GitHub wraps base64 content at 60 columns
    let compact: String = file.content.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact)
        .map_err(|e| FetchError::DataIntegrity(format!("invalid base64 content: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| FetchError::DataIntegrity(e.to_string()))
}

#[async_trait]
impl GitProvider for GitHubProvider {
    async fn resolve_ref(&self, reference: &str) -> Result<String, FetchError> {
        let path = format!("/commits/{}", reference);
        let commit: CommitRef = with_retry(&self.policy, "resolve_ref", || {
            let request = self.request(reqwest::Method::GET, &path);
            async move { read_json(request.send().await?).await }
        })
        .await?;
        Ok(commit.sha)
    }

    async fn fetch_file(&self, path: &str, reference: &str) -> Result<Option<String>, FetchError> {
        match self.get_file(path, reference).await? {
            Some(file) => decode_content(&file).map(Some),
            None => Ok(None),
        }
    }

    async fn changed_files(&self, since: &str, reference: &str) -> Result<Vec<String>, FetchError> {
        let path = format!("/compare/{}...{}", since, reference);
        let comparison: Comparison = with_retry(&self.policy, "changed_files", || {
            let request = self.request(reqwest::Method::GET, &path);
            async move { read_json(request.send().await?).await }
        })
        .await?;
        Ok(comparison.files.into_iter().map(|f| f.filename).collect())
    }

    async fn commit_file(
        &self,
        path: &str,
        content: &str,
        message: &str,
        branch: &str,
    ) -> Result<String, FetchError> {
        // Updating an existing file requires its blob sha
        let existing_sha = self.get_file(path, branch).await?.map(|f| f.sha);

        let mut body = json!({
            "message": message,
            "content": STANDARD.encode(content.as_bytes()),
            "branch": branch,
        });
        if let Some(sha) = existing_sha {
            body["sha"] = json!(sha);
        }

        let url_path = format!("/contents/{}", path.trim_start_matches('/'));
        let response: CommitResponse = with_retry(&self.policy, "commit_file", || {
            let request = self.request(reqwest::Method::PUT, &url_path).json(&body);
            async move { read_json(request.send().await?).await }
        })
        .await?;
        Ok(response.commit.sha)
    }
}
