#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;
use tempfile::TempDir;

use shiftcheck_lib::db::open_and_migrate;
use shiftcheck_lib::remote::{CompletionRequest, RemoteError, RemoteOutcome, RemoteResult, RemoteTaskService};
use shiftcheck_lib::{
    CachedArea, CachedTask, CachedUser, ChecklistItem, CompletionStatus, ItemStatus, OfflineSync,
    SyncConfig, SyncStatus, TargetStatus, TaskStatus,
};

pub async fn temp_db() -> (TempDir, SqlitePool) {
    let dir = TempDir::new().expect("tempdir");
    let pool = open_and_migrate(&dir.path().join("shiftcheck.sqlite3"))
        .await
        .expect("open and migrate");
    (dir, pool)
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        batch_size: 10,
        request_timeout_ms: 2_000,
        retry_base_ms: 40,
        retry_max_ms: 160,
        online_debounce_ms: 30,
        ..SyncConfig::default()
    }
}

pub fn item(id: &str, status: ItemStatus) -> ChecklistItem {
    ChecklistItem {
        id: id.to_string(),
        title: format!("Check {id}"),
        status,
        reason: None,
        notes: None,
        completed_by: None,
        completed_at: None,
    }
}

pub fn sample_task(id: &str, area_id: &str, version: i64, items: &[(&str, ItemStatus)]) -> CachedTask {
    CachedTask {
        id: id.to_string(),
        tenant_id: "tenant-a".to_string(),
        area_id: area_id.to_string(),
        title: format!("Task {id}"),
        status: TaskStatus::Pending,
        priority: "medium".to_string(),
        due_date: NaiveDate::from_ymd_opt(2026, 10, 19),
        scheduled_time: None,
        checklist_items: items.iter().map(|(id, status)| item(id, *status)).collect(),
        sync_version: version,
        completed_at: None,
        completion_status: None,
        updated_at: Some(Utc::now()),
        optimistic: false,
    }
}

pub fn sample_area(id: &str, parent: Option<&str>) -> CachedArea {
    CachedArea {
        id: id.to_string(),
        tenant_id: "tenant-a".to_string(),
        name: format!("Area {id}"),
        parent_id: parent.map(str::to_string),
        updated_at: Some(Utc::now()),
    }
}

pub fn sample_user(id: &str) -> CachedUser {
    CachedUser {
        id: id.to_string(),
        tenant_id: "tenant-a".to_string(),
        name: format!("User {id}"),
        role: Some("staff".to_string()),
        updated_at: Some(Utc::now()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub task_id: String,
    pub item_id: Option<String>,
    pub status: TargetStatus,
    pub expected_version: i64,
}

#[derive(Default)]
struct FakeState {
    tasks: HashMap<String, CachedTask>,
    areas: Vec<CachedArea>,
    users: Vec<CachedUser>,
    submissions: Vec<Submission>,
    /// Errors returned instead of processing the next submissions, in order.
    /// `None` lets that submission through.
    scripted: VecDeque<Option<RemoteError>>,
    offline: bool,
    /// Another actor edits the task right after each conflict response.
    race_on_conflict: bool,
    /// Held after each submission is processed, before the response returns.
    submit_delay: Option<Duration>,
    fetch_task_calls: usize,
    fetch_tasks_calls: Vec<Option<DateTime<Utc>>>,
}

/// In-memory Remote Task Service with version checks and a submission log.
#[derive(Default)]
pub struct FakeTaskService {
    state: Mutex<FakeState>,
}

impl FakeTaskService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_tasks(tasks: impl IntoIterator<Item = CachedTask>) -> Arc<Self> {
        let fake = Self::default();
        {
            let mut state = fake.state.lock().unwrap();
            for task in tasks {
                state.tasks.insert(task.id.clone(), task);
            }
        }
        Arc::new(fake)
    }

    pub fn put_task(&self, task: CachedTask) {
        self.state.lock().unwrap().tasks.insert(task.id.clone(), task);
    }

    pub fn remove_task(&self, id: &str) {
        self.state.lock().unwrap().tasks.remove(id);
    }

    pub fn put_area(&self, area: CachedArea) {
        self.state.lock().unwrap().areas.push(area);
    }

    pub fn put_user(&self, user: CachedUser) {
        self.state.lock().unwrap().users.push(user);
    }

    pub fn task(&self, id: &str) -> Option<CachedTask> {
        self.state.lock().unwrap().tasks.get(id).cloned()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn fetch_task_calls(&self) -> usize {
        self.state.lock().unwrap().fetch_task_calls
    }

    pub fn fetch_tasks_calls(&self) -> Vec<Option<DateTime<Utc>>> {
        self.state.lock().unwrap().fetch_tasks_calls.clone()
    }

    /// Script the outcome of upcoming submissions.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Option<RemoteError>>) {
        self.state.lock().unwrap().scripted.extend(outcomes);
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn race_on_conflict(&self, race: bool) {
        self.state.lock().unwrap().race_on_conflict = race;
    }

    pub fn set_submit_delay(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().submit_delay = delay;
    }

    async fn respond_after_delay(&self, outcome: RemoteResult<RemoteOutcome>) -> RemoteResult<RemoteOutcome> {
        let delay = self.state.lock().unwrap().submit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }

    /// Another staff member resolves an item directly on the server.
    pub fn resolve_by_other(&self, task_id: &str, item_id: &str, status: ItemStatus) {
        let mut state = self.state.lock().unwrap();
        let task = state.tasks.get_mut(task_id).expect("task on server");
        let item = task.item_mut(item_id).expect("item on server");
        item.status = status;
        item.completed_by = Some("someone-else".to_string());
        task.sync_version += 1;
        task.updated_at = Some(Utc::now());
    }

    /// Another actor edits the task without touching `item_id`.
    pub fn bump_version(&self, task_id: &str) {
        let mut state = self.state.lock().unwrap();
        let task = state.tasks.get_mut(task_id).expect("task on server");
        task.sync_version += 1;
        task.updated_at = Some(Utc::now());
    }

    fn apply(
        &self,
        task_id: &str,
        item_id: Option<&str>,
        request: &CompletionRequest,
    ) -> RemoteResult<RemoteOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.offline {
            return Err(RemoteError::Network("connection refused".into()));
        }
        state.submissions.push(Submission {
            task_id: task_id.to_string(),
            item_id: item_id.map(str::to_string),
            status: request.status,
            expected_version: request.expected_version,
        });
        if let Some(Some(err)) = state.scripted.pop_front() {
            return Err(err);
        }

        let race = state.race_on_conflict;
        let task = match state.tasks.get_mut(task_id) {
            Some(task) => task,
            None => return Err(RemoteError::NotFound(format!("task {task_id}"))),
        };
        if task.sync_version != request.expected_version {
            let seen = task.clone();
            if race {
                task.sync_version += 1;
                task.updated_at = Some(Utc::now());
            }
            return Ok(RemoteOutcome::Conflict(Some(seen)));
        }
        let now = Utc::now();
        match item_id {
            Some(item_id) => {
                let status = match request.status {
                    TargetStatus::Ok => ItemStatus::Ok,
                    TargetStatus::Problem => ItemStatus::Problem,
                    TargetStatus::Completed => {
                        return Err(RemoteError::Rejected {
                            status: 422,
                            message: "items cannot be `completed`".into(),
                        })
                    }
                };
                let item = match task.item_mut(item_id) {
                    Some(item) => item,
                    None => {
                        return Err(RemoteError::Rejected {
                            status: 422,
                            message: format!("unknown checklist item {item_id}"),
                        })
                    }
                };
                item.status = status;
                item.reason = request.reason.clone();
                item.notes = request.notes.clone();
                item.completed_at = Some(now);
                item.completed_by = Some("device-user".to_string());
            }
            None => {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(now);
                task.completion_status = match request.status {
                    TargetStatus::Problem => Some(CompletionStatus::Problem),
                    _ => Some(CompletionStatus::Ok),
                };
            }
        }
        task.sync_version += 1;
        task.updated_at = Some(now);
        Ok(RemoteOutcome::Applied(task.clone()))
    }
}

#[async_trait]
impl RemoteTaskService for FakeTaskService {
    async fn complete_item(
        &self,
        task_id: &str,
        item_id: &str,
        request: &CompletionRequest,
    ) -> RemoteResult<RemoteOutcome> {
        let outcome = self.apply(task_id, Some(item_id), request);
        self.respond_after_delay(outcome).await
    }

    async fn complete_task(&self, task_id: &str, request: &CompletionRequest) -> RemoteResult<RemoteOutcome> {
        let outcome = self.apply(task_id, None, request);
        self.respond_after_delay(outcome).await
    }

    async fn fetch_task(&self, task_id: &str) -> RemoteResult<Option<CachedTask>> {
        let mut state = self.state.lock().unwrap();
        if state.offline {
            return Err(RemoteError::Network("connection refused".into()));
        }
        state.fetch_task_calls += 1;
        Ok(state.tasks.get(task_id).cloned())
    }

    async fn fetch_tasks(
        &self,
        updated_since: Option<DateTime<Utc>>,
        area_id: Option<&str>,
    ) -> RemoteResult<Vec<CachedTask>> {
        let mut state = self.state.lock().unwrap();
        if state.offline {
            return Err(RemoteError::Network("connection refused".into()));
        }
        state.fetch_tasks_calls.push(updated_since);
        let mut tasks: Vec<CachedTask> = state
            .tasks
            .values()
            .filter(|t| area_id.map_or(true, |a| t.area_id == a))
            .filter(|t| match (updated_since, t.updated_at) {
                (Some(since), Some(updated)) => updated > since,
                _ => true,
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn fetch_areas(&self, _updated_since: Option<DateTime<Utc>>) -> RemoteResult<Vec<CachedArea>> {
        let state = self.state.lock().unwrap();
        if state.offline {
            return Err(RemoteError::Network("connection refused".into()));
        }
        Ok(state.areas.clone())
    }

    async fn fetch_users(&self, _updated_since: Option<DateTime<Utc>>) -> RemoteResult<Vec<CachedUser>> {
        let state = self.state.lock().unwrap();
        if state.offline {
            return Err(RemoteError::Network("connection refused".into()));
        }
        Ok(state.users.clone())
    }
}

/// Wait until the client's status satisfies `pred`, or panic after `timeout`.
pub async fn wait_for_status(
    client: &OfflineSync,
    timeout: Duration,
    mut pred: impl FnMut(&SyncStatus) -> bool,
) -> SyncStatus {
    let mut rx = client.watch();
    let result = tokio::time::timeout(timeout, async {
        loop {
            {
                let status = rx.borrow_and_update();
                if pred(&*status) {
                    return status.clone();
                }
            }
            if rx.changed().await.is_err() {
                panic!("status channel closed");
            }
        }
    })
    .await;
    match result {
        Ok(status) => status,
        Err(_) => panic!("timed out waiting for status; last = {:?}", client.status()),
    }
}
