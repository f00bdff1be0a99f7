//! Remote Task Service: the authoritative backend the sync engine talks to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SyncError;
use crate::model::{CachedArea, CachedTask, CachedUser, PendingCompletion, TargetStatus};

mod http;

pub use http::HttpTaskService;

/// Body of both completion endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub status: TargetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub expected_version: i64,
}

impl CompletionRequest {
    pub fn for_entry(entry: &PendingCompletion, expected_version: i64) -> Self {
        Self {
            status: entry.target_status,
            reason: entry.reason.clone(),
            notes: entry.notes.clone(),
            expected_version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// The mutation was applied; carries the canonical task.
    Applied(CachedTask),
    /// The server's version moved on. Carries its current task when the
    /// response included one.
    Conflict(Option<CachedTask>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Transport failure, timeout or 5xx.
    #[error("network: {0}")]
    Network(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl From<RemoteError> for SyncError {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::Network(msg) => SyncError::NetworkFailure(msg),
            other => SyncError::ValidationFailure(other.to_string()),
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[async_trait]
pub trait RemoteTaskService: Send + Sync {
    async fn complete_item(
        &self,
        task_id: &str,
        item_id: &str,
        request: &CompletionRequest,
    ) -> RemoteResult<RemoteOutcome>;

    async fn complete_task(
        &self,
        task_id: &str,
        request: &CompletionRequest,
    ) -> RemoteResult<RemoteOutcome>;

    /// `Ok(None)` when the task no longer exists.
    async fn fetch_task(&self, task_id: &str) -> RemoteResult<Option<CachedTask>>;

    async fn fetch_tasks(
        &self,
        updated_since: Option<DateTime<Utc>>,
        area_id: Option<&str>,
    ) -> RemoteResult<Vec<CachedTask>>;

    async fn fetch_areas(&self, updated_since: Option<DateTime<Utc>>) -> RemoteResult<Vec<CachedArea>>;

    async fn fetch_users(&self, updated_since: Option<DateTime<Utc>>) -> RemoteResult<Vec<CachedUser>>;
}

/// Submit a queued entry to the matching endpoint.
pub async fn submit(
    remote: &dyn RemoteTaskService,
    entry: &PendingCompletion,
    expected_version: i64,
) -> RemoteResult<RemoteOutcome> {
    let request = CompletionRequest::for_entry(entry, expected_version);
    match entry.checklist_item_id.as_deref() {
        Some(item_id) => remote.complete_item(&entry.task_id, item_id, &request).await,
        None => remote.complete_task(&entry.task_id, &request).await,
    }
}
