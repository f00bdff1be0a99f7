use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{CompletionRequest, RemoteError, RemoteOutcome, RemoteResult, RemoteTaskService};
use crate::config::SyncConfig;
use crate::model::{CachedArea, CachedTask, CachedUser};
use crate::time::to_wire;

const TENANT_HEADER: &str = "X-Tenant-Id";

/// 409 payloads come either wrapped as `{ "task": ... }` or as the bare task.
#[derive(Deserialize)]
#[serde(untagged)]
enum ConflictBody {
    Wrapped { task: CachedTask },
    Bare(CachedTask),
}

/// `RemoteTaskService` over the REST API.
#[derive(Clone)]
pub struct HttpTaskService {
    client: reqwest::Client,
    base: Url,
    tenant_id: Option<String>,
    token: Option<String>,
}

impl HttpTaskService {
    pub fn new(base_url: &str, timeout: Duration) -> RemoteResult<Self> {
        let base = Url::parse(base_url).map_err(|e| RemoteError::Rejected {
            status: 0,
            message: format!("invalid server url `{base_url}`: {e}"),
        })?;
        if base.cannot_be_a_base() {
            return Err(RemoteError::Rejected {
                status: 0,
                message: format!("server url `{base_url}` cannot carry a path"),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base,
            tenant_id: None,
            token: None,
        })
    }

    pub fn from_config(config: &SyncConfig) -> RemoteResult<Self> {
        let mut service = Self::new(&config.server_url, config.request_timeout())?;
        service.tenant_id = config.tenant_id.clone();
        service.token = config.api_token.clone();
        Ok(service)
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // `new` rejects cannot-be-a-base urls, so the segments are writable.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn decorate(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = match &self.tenant_id {
            Some(tenant) => builder.header(TENANT_HEADER, tenant),
            None => builder,
        };
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> RemoteResult<Response> {
        self.decorate(builder).send().await.map_err(transport_error)
    }

    async fn post_completion(&self, url: Url, request: &CompletionRequest) -> RemoteResult<RemoteOutcome> {
        debug!(target: "shiftcheck", event = "remote_submit", url = %url, expected_version = request.expected_version);
        let response = self.send(self.client.post(url).json(request)).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(RemoteOutcome::Applied(decode(response).await?));
        }
        if status == StatusCode::CONFLICT {
            let body = response.bytes().await.map_err(transport_error)?;
            let task = match serde_json::from_slice::<ConflictBody>(&body) {
                Ok(ConflictBody::Wrapped { task }) | Ok(ConflictBody::Bare(task)) => Some(task),
                Err(err) => {
                    warn!(target: "shiftcheck", event = "conflict_body_unreadable", error = %err);
                    None
                }
            };
            return Ok(RemoteOutcome::Conflict(task));
        }
        Err(status_error(response).await)
    }

    async fn get_list<T: DeserializeOwned>(
        &self,
        segment: &str,
        updated_since: Option<DateTime<Utc>>,
        area_id: Option<&str>,
    ) -> RemoteResult<Vec<T>> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(since) = updated_since {
            query.push(("updatedSince", to_wire(&since)));
        }
        if let Some(area) = area_id {
            query.push(("areaId", area.to_string()));
        }
        let builder = self.client.get(self.url(&[segment])).query(&query);
        let response = self.send(builder).await?;
        if response.status().is_success() {
            decode(response).await
        } else {
            Err(status_error(response).await)
        }
    }
}

fn transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Network(format!("timed out: {error}"))
    } else if error.is_connect() {
        RemoteError::Network(format!("connection failed: {error}"))
    } else {
        RemoteError::Network(error.to_string())
    }
}

/// Decode a success body. A body that arrived whole but does not parse will
/// not parse on a retry either, so it is a rejection rather than a network failure.
async fn decode<T: DeserializeOwned>(response: Response) -> RemoteResult<T> {
    let status = response.status().as_u16();
    let body = response.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&body).map_err(|e| RemoteError::Rejected {
        status,
        message: format!("unreadable response body: {e}"),
    })
}

async fn status_error(response: Response) -> RemoteError {
    let status = response.status();
    let message = response.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => RemoteError::NotFound(message),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS || s == StatusCode::REQUEST_TIMEOUT => {
            RemoteError::Network(format!("server returned {s}: {message}"))
        }
        s => RemoteError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl RemoteTaskService for HttpTaskService {
    async fn complete_item(
        &self,
        task_id: &str,
        item_id: &str,
        request: &CompletionRequest,
    ) -> RemoteResult<RemoteOutcome> {
        let url = self.url(&["tasks", task_id, "checklist", item_id, "complete"]);
        self.post_completion(url, request).await
    }

    async fn complete_task(&self, task_id: &str, request: &CompletionRequest) -> RemoteResult<RemoteOutcome> {
        let url = self.url(&["tasks", task_id, "complete"]);
        self.post_completion(url, request).await
    }

    async fn fetch_task(&self, task_id: &str) -> RemoteResult<Option<CachedTask>> {
        let response = self.send(self.client.get(self.url(&["tasks", task_id]))).await?;
        if response.status().is_success() {
            return decode(response).await.map(Some);
        }
        match status_error(response).await {
            RemoteError::NotFound(_) => Ok(None),
            other => Err(other),
        }
    }

    async fn fetch_tasks(
        &self,
        updated_since: Option<DateTime<Utc>>,
        area_id: Option<&str>,
    ) -> RemoteResult<Vec<CachedTask>> {
        self.get_list("tasks", updated_since, area_id).await
    }

    async fn fetch_areas(&self, updated_since: Option<DateTime<Utc>>) -> RemoteResult<Vec<CachedArea>> {
        self.get_list("areas", updated_since, None).await
    }

    async fn fetch_users(&self, updated_since: Option<DateTime<Utc>>) -> RemoteResult<Vec<CachedUser>> {
        self.get_list("users", updated_since, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_segments_are_escaped_under_base_path() {
        let service = HttpTaskService::new("https://qm.example.com/api/", Duration::from_secs(5)).unwrap();
        let url = service.url(&["tasks", "t 1", "checklist", "i/2", "complete"]);
        assert_eq!(
            url.as_str(),
            "https://qm.example.com/api/tasks/t%201/checklist/i%2F2/complete"
        );
    }

    #[test]
    fn rejects_non_base_urls() {
        assert!(HttpTaskService::new("mailto:ops@example.com", Duration::from_secs(1)).is_err());
    }
}
