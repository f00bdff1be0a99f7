//! Records mirrored from the Remote Task Service and the queued mutations
//! recorded against them.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::id::LocalId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Overdue,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Overdue => "overdue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Ok,
    Problem,
}

/// Outcome recorded on a completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Ok,
    Problem,
}

/// Status a queued completion asks the server to record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Ok,
    Problem,
    Completed,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Ok => "ok",
            TargetStatus::Problem => "problem",
            TargetStatus::Completed => "completed",
        }
    }

    /// Item state this target maps to, if it is valid for a checklist item.
    pub fn item_status(&self) -> Option<ItemStatus> {
        match self {
            TargetStatus::Ok => Some(ItemStatus::Ok),
            TargetStatus::Problem => Some(ItemStatus::Problem),
            TargetStatus::Completed => None,
        }
    }

    pub fn completion_status(&self) -> Option<CompletionStatus> {
        match self {
            TargetStatus::Ok => Some(CompletionStatus::Ok),
            TargetStatus::Problem => Some(CompletionStatus::Problem),
            TargetStatus::Completed => None,
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(TargetStatus::Ok),
            "problem" => Ok(TargetStatus::Problem),
            "completed" => Ok(TargetStatus::Completed),
            other => Err(format!("unknown target status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistItem {
    pub id: String,
    pub title: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedTask {
    pub id: String,
    pub tenant_id: String,
    pub area_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<NaiveTime>,
    #[serde(default)]
    pub checklist_items: Vec<ChecklistItem>,
    pub sync_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_status: Option<CompletionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Set while the record carries local effects the server has not confirmed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optimistic: bool,
}

impl CachedTask {
    pub fn item(&self, item_id: &str) -> Option<&ChecklistItem> {
        self.checklist_items.iter().find(|item| item.id == item_id)
    }

    pub fn item_mut(&mut self, item_id: &str) -> Option<&mut ChecklistItem> {
        self.checklist_items.iter_mut().find(|item| item.id == item_id)
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedArea {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedUser {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A completion recorded on this device and not yet confirmed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCompletion {
    pub local_id: LocalId,
    pub task_id: String,
    /// `None` completes the whole task.
    pub checklist_item_id: Option<String>,
    pub target_status: TargetStatus,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub base_sync_version: i64,
    pub created_at: DateTime<Utc>,
    pub synced: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Terminal failure: kept for the user but no longer sent.
    pub failed: bool,
}

/// Input for [`crate::queue::PendingQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCompletion {
    pub task_id: String,
    #[serde(default)]
    pub checklist_item_id: Option<String>,
    pub target_status: TargetStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewCompletion {
    pub fn item(task_id: impl Into<String>, item_id: impl Into<String>, status: TargetStatus) -> Self {
        Self {
            task_id: task_id.into(),
            checklist_item_id: Some(item_id.into()),
            target_status: status,
            reason: None,
            notes: None,
        }
    }

    pub fn task(task_id: impl Into<String>, status: TargetStatus) -> Self {
        Self {
            task_id: task_id.into(),
            checklist_item_id: None,
            target_status: status,
            reason: None,
            notes: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Last successful refresh of one entity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    pub key: String,
    pub last_synced_at: DateTime<Utc>,
}

/// Apply a completion's local effect to a task and bump its provisional version.
pub fn apply_completion(
    task: &mut CachedTask,
    item_id: Option<&str>,
    target: TargetStatus,
    reason: Option<&str>,
    notes: Option<&str>,
    at: DateTime<Utc>,
) -> bool {
    let applied = match item_id {
        Some(item_id) => match (task.item_mut(item_id), target.item_status()) {
            (Some(item), Some(status)) => {
                item.status = status;
                item.reason = reason.map(str::to_owned);
                item.notes = notes.map(str::to_owned);
                item.completed_at = Some(at);
                true
            }
            _ => false,
        },
        None => {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(at);
            task.completion_status = target.completion_status();
            true
        }
    };
    if applied {
        task.sync_version += 1;
        task.optimistic = true;
    }
    applied
}
