//! Offline-first task cache and synchronization core for checklist-based
//! quality management.
//!
//! Completions are recorded locally, applied optimistically to the cached
//! task, and replayed against the Remote Task Service when the device is online.

pub mod cache;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod error;
pub mod id;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod queue;
pub mod remote;
pub mod time;
pub mod worker;

pub use cache::{CacheRecord, IndexFilter, LocalCache, PutOutcome, Store};
pub use client::OfflineSync;
pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, LinkState, Subscription, SyncStatus, Transition};
pub use engine::{PassReport, SyncEngine, SyncNotice};
pub use error::{AppError, SyncError, SyncResult};
pub use id::LocalId;
pub use logging::{flush_file_logs, init_logging};
pub use model::{
    CachedArea, CachedTask, CachedUser, ChecklistItem, CompletionStatus, ItemStatus, NewCompletion,
    PendingCompletion, SyncMeta, TargetStatus, TaskStatus,
};
pub use queue::{CorruptEntry, PendingQueue, QueueBatch};
pub use remote::{
    CompletionRequest, HttpTaskService, RemoteError, RemoteOutcome, RemoteTaskService,
};
pub use worker::{PassOutcome, SyncPhase, TriggerReason};
