//! `OfflineSync`: the surface the UI layer talks to.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{IndexFilter, LocalCache};
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, Subscription, SyncStatus, Transition};
use crate::db::{open_and_migrate, DB_FILE_NAME};
use crate::engine::{SyncEngine, SyncNotice};
use crate::error::{SyncError, SyncResult};
use crate::id::LocalId;
use crate::model::{CachedArea, CachedTask, CachedUser, NewCompletion, PendingCompletion};
use crate::queue::{CorruptEntry, PendingQueue};
use crate::remote::RemoteTaskService;
use crate::worker::{PassOutcome, SyncHandle, SyncWorker, TriggerReason};

/// Where the store lives when the config does not say.
pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("shiftcheck")
        .join(DB_FILE_NAME)
}

pub fn resolve_db_path(config: &SyncConfig) -> PathBuf {
    config.db_path.clone().unwrap_or_else(default_db_path)
}

pub struct OfflineSync {
    cache: LocalCache,
    queue: PendingQueue,
    remote: Arc<dyn RemoteTaskService>,
    monitor: ConnectivityMonitor,
    engine: Arc<SyncEngine>,
    handle: SyncHandle,
    worker: JoinHandle<()>,
    area_id: Option<String>,
}

impl OfflineSync {
    /// Open the on-device store named by `config` and start syncing.
    pub async fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteTaskService>,
        is_online: bool,
    ) -> anyhow::Result<Self> {
        let path = resolve_db_path(&config);
        let pool = open_and_migrate(&path)
            .await
            .with_context(|| format!("open offline store {}", path.display()))?;
        Ok(Self::start(pool, remote, config, is_online).await)
    }

    /// Start the sync worker over an already migrated pool.
    pub async fn start(
        pool: SqlitePool,
        remote: Arc<dyn RemoteTaskService>,
        config: SyncConfig,
        is_online: bool,
    ) -> Self {
        let cache = LocalCache::new(pool.clone());
        let queue = PendingQueue::new(pool);
        let monitor = ConnectivityMonitor::new(is_online);
        let engine = Arc::new(SyncEngine::new(
            cache.clone(),
            queue.clone(),
            remote.clone(),
            &config,
        ));
        let area_id = config.area_id.clone();
        let (handle, worker) = SyncWorker::spawn(engine.clone(), monitor.clone(), config);

        let client = Self {
            cache,
            queue,
            remote,
            monitor,
            engine,
            handle,
            worker,
            area_id,
        };
        client.refresh_counts().await;
        info!(target: "shiftcheck", event = "offline_sync_started", online = is_online);
        client
    }

    /// Record a completion locally. Never needs the network; a pass is
    /// requested when online.
    pub async fn enqueue_completion(&self, completion: NewCompletion) -> SyncResult<LocalId> {
        let local_id = self.queue.enqueue(completion).await?;
        self.refresh_counts().await;
        if self.monitor.is_online() {
            self.handle.trigger(TriggerReason::Enqueued);
        }
        Ok(local_id)
    }

    pub async fn force_sync_now(&self) -> SyncResult<PassOutcome> {
        self.handle.sync_now().await
    }

    pub fn status(&self) -> SyncStatus {
        self.monitor.status()
    }

    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.monitor.watch()
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(&SyncStatus) + Send + 'static,
    {
        self.monitor.on_change(handler)
    }

    pub fn on_connectivity_change<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(bool) + Send + 'static,
    {
        self.monitor.on_connectivity_change(handler)
    }

    pub fn set_online(&self, online: bool) -> Transition {
        self.monitor.set_online(online)
    }

    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.engine.notices()
    }

    pub async fn pending_entries(&self) -> SyncResult<Vec<PendingCompletion>> {
        Ok(self.queue.all_entries().await?.entries)
    }

    pub async fn failed_entries(&self) -> SyncResult<Vec<PendingCompletion>> {
        Ok(self.queue.failed_entries().await?.entries)
    }

    /// Parked rows that could not be decoded. They count toward
    /// `failed_count` next to [`OfflineSync::failed_entries`].
    pub async fn corrupt_entries(&self) -> SyncResult<Vec<CorruptEntry>> {
        Ok(self.queue.failed_entries().await?.corrupt)
    }

    pub async fn discard_corrupt(&self, entry: &CorruptEntry) -> SyncResult<bool> {
        let removed = self.queue.discard_corrupt(entry.seq).await?;
        self.refresh_counts().await;
        Ok(removed)
    }

    /// Drop a failed entry at the user's request. The next pass restores the
    /// server's version of the task.
    pub async fn discard_failed(&self, local_id: &LocalId) -> SyncResult<bool> {
        let removed = self.queue.discard(&local_id.to_string()).await?;
        self.refresh_counts().await;
        if removed && self.monitor.is_online() {
            self.handle.trigger(TriggerReason::Manual);
        }
        Ok(removed)
    }

    pub async fn task(&self, id: &str) -> SyncResult<Option<CachedTask>> {
        match self.cache.get::<CachedTask>(id).await {
            Err(SyncError::CacheUnavailable(reason)) => {
                degrade("task", &reason);
                Ok(self.remote.fetch_task(id).await?)
            }
            other => other,
        }
    }

    pub async fn tasks(&self, filter: Option<&IndexFilter>) -> SyncResult<Vec<CachedTask>> {
        match self.cache.get_all::<CachedTask>(filter).await {
            Err(SyncError::CacheUnavailable(reason)) => {
                degrade("tasks", &reason);
                let tasks = self.remote.fetch_tasks(None, self.area_id.as_deref()).await?;
                Ok(match filter {
                    Some(filter) => tasks.into_iter().filter(|t| filter.matches_task(t)).collect(),
                    None => tasks,
                })
            }
            other => other,
        }
    }

    pub async fn areas(&self, filter: Option<&IndexFilter>) -> SyncResult<Vec<CachedArea>> {
        match self.cache.get_all::<CachedArea>(filter).await {
            Err(SyncError::CacheUnavailable(reason)) => {
                degrade("areas", &reason);
                let areas = self.remote.fetch_areas(None).await?;
                Ok(match filter {
                    Some(filter) => areas.into_iter().filter(|a| filter.matches_area(a)).collect(),
                    None => areas,
                })
            }
            other => other,
        }
    }

    pub async fn users(&self) -> SyncResult<Vec<CachedUser>> {
        match self.cache.get_all::<CachedUser>(None).await {
            Err(SyncError::CacheUnavailable(reason)) => {
                degrade("users", &reason);
                Ok(self.remote.fetch_users(None).await?)
            }
            other => other,
        }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    /// Stop the worker after any in-flight pass finishes.
    pub async fn shutdown(self) {
        self.handle.shutdown().await;
        if let Err(err) = self.worker.await {
            warn!(target: "shiftcheck", event = "sync_worker_join_failed", error = %err);
        }
    }

    async fn refresh_counts(&self) {
        match (self.queue.pending_count().await, self.queue.failed_count().await) {
            (Ok(pending), Ok(failed)) => self.monitor.set_counts(pending, failed),
            (Err(err), _) | (_, Err(err)) => {
                warn!(target: "shiftcheck", event = "queue_count_failed", error = %err);
            }
        }
    }
}

fn degrade(store: &'static str, reason: &str) {
    warn!(target: "shiftcheck", event = "cache_degraded_to_remote", store, error = %reason);
}
