//! One synchronization pass: replay the pending queue against the Remote Task
//! Service, then refresh the cache from authoritative state.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::{
    begin_write, remove_record, write_record_with, IndexFilter, LocalCache, PutOutcome, Store,
    META_AREAS, META_TASKS, META_USERS,
};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::id::LocalId;
use crate::model::{CachedTask, ItemStatus, PendingCompletion};
use crate::queue::{remove_entry, replay_onto, sendable_for_task, PendingQueue};
use crate::remote::{submit, RemoteError, RemoteOutcome, RemoteTaskService};
use crate::time::now_utc;

const NOTICE_CAPACITY: usize = 64;

/// Non-blocking banner messages produced by a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncNotice {
    /// Someone else resolved the item or task first; the local change was dropped.
    AlreadyHandled {
        local_id: LocalId,
        task_id: String,
        item_id: Option<String>,
    },
    /// The server refused the change; it stays listed until discarded.
    Rejected {
        local_id: LocalId,
        task_id: String,
        reason: String,
    },
    Corrupt { local_id: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub started_at: Option<DateTime<Utc>>,
    /// Entries confirmed by the server, in submission order.
    pub synced: Vec<LocalId>,
    pub merged: usize,
    pub already_handled: usize,
    pub rejected: usize,
    pub corrupt: usize,
    pub reconciled: usize,
    pub refreshed_tasks: usize,
    pub pruned_tasks: usize,
    /// Set when a transient failure stopped the pass early.
    pub halted: Option<String>,
}

impl PassReport {
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }
}

enum EntryOutcome {
    Synced,
    Merged,
    AlreadyHandled,
    Rejected,
    Halt(String),
}

/// Write an authoritative task, re-applying the still-sendable entries of that
/// task on top so provisional state survives the refresh. A task older than
/// the cached confirmed version is ignored.
async fn apply_server_task(conn: &mut SqliteConnection, mut task: CachedTask) -> SyncResult<PutOutcome> {
    let confirmed = task.sync_version;
    task.optimistic = false;
    let remaining = sendable_for_task(conn, &task.id).await?;
    replay_onto(&mut task, &remaining);
    write_record_with(conn, &task, Some(confirmed)).await
}

pub struct SyncEngine {
    cache: LocalCache,
    queue: PendingQueue,
    remote: Arc<dyn RemoteTaskService>,
    notices: broadcast::Sender<SyncNotice>,
    batch_size: usize,
    area_id: Option<String>,
    full_refresh_after: TimeDelta,
}

impl SyncEngine {
    pub fn new(
        cache: LocalCache,
        queue: PendingQueue,
        remote: Arc<dyn RemoteTaskService>,
        config: &SyncConfig,
    ) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            cache,
            queue,
            remote,
            notices,
            batch_size: config.batch_size.max(1),
            area_id: config.area_id.clone(),
            full_refresh_after: config.full_refresh_after(),
        }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    fn notify(&self, notice: SyncNotice) {
        // No receivers is fine: notices are advisory.
        let _ = self.notices.send(notice);
    }

    /// Run one pass. Callers guarantee no other pass is in flight.
    pub async fn run_pass(&self) -> SyncResult<PassReport> {
        let started_at = now_utc();
        let mut report = PassReport {
            started_at: Some(started_at),
            ..PassReport::default()
        };

        let batch = self.queue.peek_batch(self.batch_size).await?;
        info!(
            target: "shiftcheck",
            event = "sync_pass_start",
            entries = batch.entries.len(),
            corrupt = batch.corrupt.len()
        );

        for corrupt in &batch.corrupt {
            self.queue.mark_corrupt(corrupt).await?;
            report.corrupt += 1;
            self.notify(SyncNotice::Corrupt {
                local_id: corrupt.local_id.clone(),
                reason: corrupt.reason.clone(),
            });
        }

        for entry in &batch.entries {
            match self.process_entry(entry).await? {
                EntryOutcome::Synced => report.synced.push(entry.local_id),
                EntryOutcome::Merged => {
                    report.synced.push(entry.local_id);
                    report.merged += 1;
                }
                EntryOutcome::AlreadyHandled => report.already_handled += 1,
                EntryOutcome::Rejected => report.rejected += 1,
                EntryOutcome::Halt(reason) => {
                    warn!(
                        target: "shiftcheck",
                        event = "sync_pass_halted",
                        local_id = %entry.local_id,
                        task_id = %entry.task_id,
                        error = %reason
                    );
                    report.halted = Some(reason);
                    return Ok(report);
                }
            }
        }

        if let Err(reason) = self.refresh(started_at, &mut report).await? {
            warn!(target: "shiftcheck", event = "sync_refresh_halted", error = %reason);
            report.halted = Some(reason);
            return Ok(report);
        }

        info!(
            target: "shiftcheck",
            event = "sync_pass_complete",
            synced = report.synced.len(),
            merged = report.merged,
            already_handled = report.already_handled,
            rejected = report.rejected,
            corrupt = report.corrupt,
            refreshed_tasks = report.refreshed_tasks,
            pruned_tasks = report.pruned_tasks
        );
        Ok(report)
    }

    async fn process_entry(&self, entry: &PendingCompletion) -> SyncResult<EntryOutcome> {
        debug!(
            target: "shiftcheck",
            event = "entry_submit",
            local_id = %entry.local_id,
            task_id = %entry.task_id,
            item_id = ?entry.checklist_item_id,
            base_sync_version = entry.base_sync_version
        );
        match submit(self.remote.as_ref(), entry, entry.base_sync_version).await {
            Ok(RemoteOutcome::Applied(task)) => {
                let version = task.sync_version;
                self.settle(entry, task).await?;
                info!(
                    target: "shiftcheck",
                    event = "entry_synced",
                    local_id = %entry.local_id,
                    task_id = %entry.task_id,
                    sync_version = version
                );
                Ok(EntryOutcome::Synced)
            }
            Ok(RemoteOutcome::Conflict(current)) => self.resolve_conflict(entry, current).await,
            Err(err) => self.handle_failure(entry, err).await,
        }
    }

    async fn resolve_conflict(
        &self,
        entry: &PendingCompletion,
        current: Option<CachedTask>,
    ) -> SyncResult<EntryOutcome> {
        let server = match current {
            Some(task) => task,
            None => match self.remote.fetch_task(&entry.task_id).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    return self
                        .handle_failure(entry, RemoteError::NotFound(format!("task {}", entry.task_id)))
                        .await
                }
                Err(err) => return self.handle_failure(entry, err).await,
            },
        };

        let conflict = SyncError::VersionConflict {
            task_id: entry.task_id.clone(),
            expected: entry.base_sync_version,
            actual: server.sync_version,
        };
        info!(
            target: "shiftcheck",
            event = "entry_conflict",
            local_id = %entry.local_id,
            task_id = %entry.task_id,
            expected = entry.base_sync_version,
            actual = server.sync_version,
            error = %conflict
        );

        let still_open = match entry.checklist_item_id.as_deref() {
            Some(item_id) => match server.item(item_id) {
                Some(item) => item.status == ItemStatus::Pending,
                None => {
                    let err = RemoteError::Rejected {
                        status: 409,
                        message: format!("checklist item {item_id} no longer exists"),
                    };
                    return self.handle_failure(entry, err).await;
                }
            },
            None => !server.is_completed(),
        };

        if !still_open {
            return self.discard_for_server(entry, server).await;
        }

        match submit(self.remote.as_ref(), entry, server.sync_version).await {
            Ok(RemoteOutcome::Applied(task)) => {
                let version = task.sync_version;
                self.settle(entry, task).await?;
                info!(
                    target: "shiftcheck",
                    event = "entry_merged",
                    local_id = %entry.local_id,
                    task_id = %entry.task_id,
                    sync_version = version
                );
                Ok(EntryOutcome::Merged)
            }
            // A second conflict is settled in the server's favour.
            Ok(RemoteOutcome::Conflict(latest)) => {
                self.discard_for_server(entry, latest.unwrap_or(server)).await
            }
            Err(err) => self.handle_failure(entry, err).await,
        }
    }

    async fn discard_for_server(
        &self,
        entry: &PendingCompletion,
        server: CachedTask,
    ) -> SyncResult<EntryOutcome> {
        self.settle(entry, server).await?;
        info!(
            target: "shiftcheck",
            event = "entry_already_handled",
            local_id = %entry.local_id,
            task_id = %entry.task_id,
            item_id = ?entry.checklist_item_id
        );
        self.notify(SyncNotice::AlreadyHandled {
            local_id: entry.local_id,
            task_id: entry.task_id.clone(),
            item_id: entry.checklist_item_id.clone(),
        });
        Ok(EntryOutcome::AlreadyHandled)
    }

    async fn handle_failure(&self, entry: &PendingCompletion, err: RemoteError) -> SyncResult<EntryOutcome> {
        let message = err.to_string();
        match err {
            RemoteError::Network(_) => {
                self.queue.mark_failed(&entry.local_id, &message, false).await?;
                Ok(EntryOutcome::Halt(message))
            }
            RemoteError::NotFound(_) | RemoteError::Rejected { .. } => {
                self.queue.mark_failed(&entry.local_id, &message, true).await?;
                if matches!(err, RemoteError::NotFound(_)) {
                    self.cache.delete::<CachedTask>(&entry.task_id).await?;
                }
                warn!(
                    target: "shiftcheck",
                    event = "entry_rejected",
                    local_id = %entry.local_id,
                    task_id = %entry.task_id,
                    error = %message
                );
                self.notify(SyncNotice::Rejected {
                    local_id: entry.local_id,
                    task_id: entry.task_id.clone(),
                    reason: message,
                });
                Ok(EntryOutcome::Rejected)
            }
        }
    }

    /// Confirm an entry: drop it from the queue and store the server's task
    /// with the task's remaining entries replayed on top, in one transaction.
    async fn settle(&self, entry: &PendingCompletion, server: CachedTask) -> SyncResult<()> {
        let mut tx = begin_write(self.cache.pool()).await?;
        remove_entry(&mut tx, &entry.local_id).await?;
        apply_server_task(&mut tx, server).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn store_server_task(&self, task: CachedTask) -> SyncResult<()> {
        let mut tx = begin_write(self.cache.pool()).await?;
        apply_server_task(&mut tx, task).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Refresh stage. The inner `Err` carries a transient failure that halted it.
    async fn refresh(
        &self,
        started_at: DateTime<Utc>,
        report: &mut PassReport,
    ) -> SyncResult<Result<(), String>> {
        if let Err(reason) = self.reconcile_orphans(report).await? {
            return Ok(Err(reason));
        }
        if let Err(reason) = self.refresh_tasks(started_at, report).await? {
            return Ok(Err(reason));
        }
        if let Err(reason) = self.refresh_areas(started_at).await? {
            return Ok(Err(reason));
        }
        self.refresh_users(started_at).await
    }

    /// Tasks still flagged optimistic with nothing left to send carry effects
    /// of rejected or discarded entries; replace them with server truth.
    async fn reconcile_orphans(&self, report: &mut PassReport) -> SyncResult<Result<(), String>> {
        for task_id in self.cache.optimistic_task_ids().await? {
            if !self.queue.pending_for_task(&task_id).await?.is_empty() {
                continue;
            }
            match self.remote.fetch_task(&task_id).await {
                Ok(Some(task)) => self.store_server_task(task).await?,
                Ok(None) => {
                    let mut conn = self.cache.pool().acquire().await?;
                    remove_record(&mut conn, Store::Tasks, &task_id).await?;
                }
                Err(RemoteError::Network(reason)) => return Ok(Err(reason)),
                Err(err) => {
                    warn!(target: "shiftcheck", event = "orphan_reconcile_failed", task_id = %task_id, error = %err);
                    continue;
                }
            }
            report.reconciled += 1;
            debug!(target: "shiftcheck", event = "orphan_reconciled", task_id = %task_id);
        }
        Ok(Ok(()))
    }

    async fn since(&self, key: &str, started_at: DateTime<Utc>) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self
            .cache
            .get_meta(key)
            .await?
            .filter(|last| started_at.signed_duration_since(*last) <= self.full_refresh_after))
    }

    async fn refresh_tasks(
        &self,
        started_at: DateTime<Utc>,
        report: &mut PassReport,
    ) -> SyncResult<Result<(), String>> {
        let since = self.since(META_TASKS, started_at).await?;
        let tasks = match self.remote.fetch_tasks(since, self.area_id.as_deref()).await {
            Ok(tasks) => tasks,
            Err(RemoteError::Network(reason)) => return Ok(Err(reason)),
            Err(err) => {
                warn!(target: "shiftcheck", event = "task_refresh_failed", error = %err);
                return Ok(Ok(()));
            }
        };

        let fetched: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
        report.refreshed_tasks = tasks.len();
        for task in tasks {
            self.store_server_task(task).await?;
        }

        if since.is_none() {
            report.pruned_tasks = self.prune_tasks(&fetched).await?;
        }
        self.cache.set_meta(META_TASKS, started_at).await?;
        info!(
            target: "shiftcheck",
            event = "tasks_refreshed",
            full = since.is_none(),
            count = report.refreshed_tasks,
            pruned = report.pruned_tasks
        );
        Ok(Ok(()))
    }

    /// After a full refresh, drop cached tasks the server no longer lists,
    /// keeping any that still have queue entries.
    async fn prune_tasks(&self, fetched: &HashSet<String>) -> SyncResult<usize> {
        let cached_ids = match &self.area_id {
            Some(area) => self
                .cache
                .get_all::<CachedTask>(Some(&IndexFilter::TaskArea(area.clone())))
                .await?
                .into_iter()
                .map(|t| t.id)
                .collect(),
            None => self.cache.ids(Store::Tasks).await?,
        };

        let queued: HashSet<String> = self
            .queue
            .all_entries()
            .await?
            .entries
            .into_iter()
            .map(|e| e.task_id)
            .collect();

        let mut pruned = 0;
        for id in cached_ids {
            if fetched.contains(&id) || queued.contains(&id) {
                continue;
            }
            self.cache.delete::<CachedTask>(&id).await?;
            pruned += 1;
        }
        Ok(pruned)
    }

    async fn refresh_areas(&self, started_at: DateTime<Utc>) -> SyncResult<Result<(), String>> {
        let since = self.since(META_AREAS, started_at).await?;
        match self.remote.fetch_areas(since).await {
            Ok(areas) => {
                for area in &areas {
                    self.cache.put(area).await?;
                }
                self.cache.set_meta(META_AREAS, started_at).await?;
                debug!(target: "shiftcheck", event = "areas_refreshed", count = areas.len());
                Ok(Ok(()))
            }
            Err(RemoteError::Network(reason)) => Ok(Err(reason)),
            Err(err) => {
                warn!(target: "shiftcheck", event = "area_refresh_failed", error = %err);
                Ok(Ok(()))
            }
        }
    }

    async fn refresh_users(&self, started_at: DateTime<Utc>) -> SyncResult<Result<(), String>> {
        let since = self.since(META_USERS, started_at).await?;
        match self.remote.fetch_users(since).await {
            Ok(users) => {
                for user in &users {
                    self.cache.put(user).await?;
                }
                self.cache.set_meta(META_USERS, started_at).await?;
                debug!(target: "shiftcheck", event = "users_refreshed", count = users.len());
                Ok(Ok(()))
            }
            Err(RemoteError::Network(reason)) => Ok(Err(reason)),
            Err(err) => {
                warn!(target: "shiftcheck", event = "user_refresh_failed", error = %err);
                Ok(Ok(()))
            }
        }
    }
}
