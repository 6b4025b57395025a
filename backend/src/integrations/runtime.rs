use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{read_json, with_retry, FetchError, RetryPolicy, RuntimeClient, RuntimeCredential, RuntimeWorkflowSummary};

const PAGE_LIMIT: u32 = 100;

/// Fields sent on create/update. `staticData` holds the source runtime's
/// trigger state and stays behind.
const WRITABLE_FIELDS: &[&str] = &["name", "nodes", "connections", "settings"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    data: Vec<T>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

/// REST client for one runtime engine instance
pub struct HttpRuntimeClient {
    http: reqwest::Client,
    base_url: String,
    api_key_header: String,
    api_key: String,
    policy: RetryPolicy,
}

impl HttpRuntimeClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        api_key_header: &str,
        api_key: &str,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key_header: api_key_header.to_string(),
            api_key: api_key.to_string(),
            policy,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .header(self.api_key_header.as_str(), self.api_key.as_str())
            .header("Accept", "application/json")
    }

    /// Follow `nextCursor` until the runtime stops returning one
    async fn fetch_pages<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        extra_query: &[(&str, &str)],
    ) -> Result<Vec<T>, FetchError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page: Page<T> = with_retry(&self.policy, operation, || {
                let mut query: Vec<(&str, String)> = vec![("limit", PAGE_LIMIT.to_string())];
                query.extend(extra_query.iter().map(|(k, v)| (*k, v.to_string())));
                if let Some(cursor) = &cursor {
                    query.push(("cursor", cursor.clone()));
                }
                let request = self.request(reqwest::Method::GET, path).query(&query);
                async move { read_json(request.send().await?).await }
            })
            .await?;

            items.extend(page.data);
            match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(items)
    }
}

fn writable_body(definition: &Value) -> Value {
    match definition.as_object() {
        Some(fields) => Value::Object(
            fields
                .iter()
                .filter(|(k, _)| WRITABLE_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<String, Value>>(),
        ),
        None => definition.clone(),
    }
}

#[async_trait]
impl RuntimeClient for HttpRuntimeClient {
    async fn list_workflows(&self) -> Result<Vec<RuntimeWorkflowSummary>, FetchError> {
        self.fetch_pages("list_workflows", "/workflows", &[]).await
    }

    async fn get_workflow(&self, id: &str) -> Result<Value, FetchError> {
        let path = format!("/workflows/{}", id);
        with_retry(&self.policy, "get_workflow", || {
            let request = self.request(reqwest::Method::GET, &path);
            async move { read_json(request.send().await?).await }
        })
        .await
    }

    async fn list_credentials(&self, credential_type: &str) -> Result<Vec<RuntimeCredential>, FetchError> {
        let credentials: Vec<RuntimeCredential> = self
            .fetch_pages("list_credentials", "/credentials", &[("type", credential_type)])
            .await?;
        // Some runtime versions ignore the filter
        Ok(credentials
            .into_iter()
            .filter(|c| c.credential_type == credential_type)
            .collect())
    }

    async fn deploy_workflow(
        &self,
        existing_id: Option<&str>,
        definition: &Value,
    ) -> Result<String, FetchError> {
        let body = writable_body(definition);
        let (method, path) = match existing_id {
            Some(id) => (reqwest::Method::PUT, format!("/workflows/{}", id)),
            None => (reqwest::Method::POST, "/workflows".to_string()),
        };

        // Creation is not idempotent; a retried POST could create duplicates
        let policy = match existing_id {
            Some(_) => self.policy,
            None => RetryPolicy {
                max_retries: 0,
                ..self.policy
            },
        };

        let created: Created = with_retry(&policy, "deploy_workflow", || {
            let request = self.request(method.clone(), &path).json(&body);
            async move { read_json(request.send().await?).await }
        })
        .await?;
        Ok(created.id)
    }

    async fn activate_workflow(&self, id: &str) -> Result<(), FetchError> {
        let path = format!("/workflows/{}/activate", id);
        let _: Value = with_retry(&self.policy, "activate_workflow", || {
            let request = self.request(reqwest::Method::POST, &path);
            async move { read_json(request.send().await?).await }
        })
        .await?;
        Ok(())
    }
}
