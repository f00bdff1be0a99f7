//! Pending-Mutation Queue: the durable FIFO log of completions recorded on
//! this device that the server has not confirmed yet.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::cache::{begin_write, read_body, write_record, Store};
use crate::error::{SyncError, SyncResult};
use crate::id::LocalId;
use crate::model::{apply_completion, CachedTask, NewCompletion, PendingCompletion, TargetStatus};
use crate::time::{from_wire, now_utc, to_wire};

const SELECT_COLUMNS: &str = "seq, local_id, task_id, checklist_item_id, target_status, reason, notes, \
     base_sync_version, created_at, synced, attempts, last_error, failed";

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    seq: i64,
    local_id: String,
    task_id: String,
    checklist_item_id: Option<String>,
    target_status: String,
    reason: Option<String>,
    notes: Option<String>,
    base_sync_version: i64,
    created_at: String,
    synced: i64,
    attempts: i64,
    last_error: Option<String>,
    failed: i64,
}

impl QueueRow {
    fn decode(self) -> Result<PendingCompletion, CorruptEntry> {
        let corrupt = |reason: String| CorruptEntry {
            seq: self.seq,
            local_id: self.local_id.clone(),
            reason,
        };
        let local_id: LocalId = self
            .local_id
            .parse()
            .map_err(|e| corrupt(format!("local_id: {e}")))?;
        let target_status: TargetStatus = self.target_status.parse().map_err(corrupt)?;
        let created_at = from_wire(&self.created_at)
            .ok_or_else(|| corrupt(format!("created_at `{}` is not a timestamp", self.created_at)))?;
        if self.checklist_item_id.is_some() && target_status.item_status().is_none() {
            return Err(corrupt(format!(
                "status `{target_status}` is not valid for a checklist item"
            )));
        }
        let attempts = u32::try_from(self.attempts).map_err(|_| corrupt("negative attempts".into()))?;

        Ok(PendingCompletion {
            local_id,
            task_id: self.task_id,
            checklist_item_id: self.checklist_item_id,
            target_status,
            reason: self.reason,
            notes: self.notes,
            base_sync_version: self.base_sync_version,
            created_at,
            synced: self.synced != 0,
            attempts,
            last_error: self.last_error,
            failed: self.failed != 0,
        })
    }
}

/// A persisted row that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptEntry {
    pub seq: i64,
    pub local_id: String,
    pub reason: String,
}

impl CorruptEntry {
    pub fn to_error(&self) -> SyncError {
        SyncError::QueueCorruption {
            local_id: self.local_id.clone(),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueBatch {
    pub entries: Vec<PendingCompletion>,
    pub corrupt: Vec<CorruptEntry>,
}

impl QueueBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.corrupt.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.corrupt.len()
    }
}

fn split_rows(rows: Vec<QueueRow>) -> QueueBatch {
    let mut batch = QueueBatch::default();
    for row in rows {
        match row.decode() {
            Ok(entry) => batch.entries.push(entry),
            Err(corrupt) => {
                warn!(
                    target: "shiftcheck",
                    event = "queue_entry_corrupt",
                    seq = corrupt.seq,
                    local_id = %corrupt.local_id,
                    reason = %corrupt.reason
                );
                batch.corrupt.push(corrupt);
            }
        }
    }
    batch
}

async fn insert_entry(conn: &mut SqliteConnection, entry: &PendingCompletion) -> SyncResult<()> {
    sqlx::query(
        "INSERT INTO pending_completions \
         (local_id, task_id, checklist_item_id, target_status, reason, notes, base_sync_version, \
          created_at, synced, attempts, last_error, failed) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0, NULL, 0)",
    )
    .bind(entry.local_id.to_string())
    .bind(&entry.task_id)
    .bind(&entry.checklist_item_id)
    .bind(entry.target_status.as_str())
    .bind(&entry.reason)
    .bind(&entry.notes)
    .bind(entry.base_sync_version)
    .bind(to_wire(&entry.created_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Still-sendable entries of one task in creation order. Corrupt rows are skipped.
pub(crate) async fn sendable_for_task(
    conn: &mut SqliteConnection,
    task_id: &str,
) -> SyncResult<Vec<PendingCompletion>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM pending_completions \
         WHERE task_id = ? AND synced = 0 AND failed = 0 ORDER BY seq"
    );
    let rows: Vec<QueueRow> = sqlx::query_as(&sql)
        .bind(task_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(split_rows(rows).entries)
}

pub(crate) async fn remove_entry(conn: &mut SqliteConnection, local_id: &LocalId) -> SyncResult<bool> {
    let res = sqlx::query("DELETE FROM pending_completions WHERE local_id = ?")
        .bind(local_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Re-apply the local effects of `pending` on top of `task`.
pub(crate) fn replay_onto(task: &mut CachedTask, pending: &[PendingCompletion]) {
    for entry in pending {
        apply_completion(
            task,
            entry.checklist_item_id.as_deref(),
            entry.target_status,
            entry.reason.as_deref(),
            entry.notes.as_deref(),
            entry.created_at,
        );
    }
}

#[derive(Clone)]
pub struct PendingQueue {
    pool: SqlitePool,
}

impl PendingQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a completion and apply its effect to the cached task, atomically.
    ///
    /// Succeeds without a network. When the task is not cached, or its cached
    /// body is unreadable, the entry is based on version 0 and no local effect
    /// is applied.
    pub async fn enqueue(&self, completion: NewCompletion) -> SyncResult<LocalId> {
        if completion.checklist_item_id.is_some() && completion.target_status.item_status().is_none() {
            return Err(SyncError::validation(format!(
                "checklist items accept ok or problem, got `{}`",
                completion.target_status
            )));
        }

        let mut tx = begin_write(&self.pool).await?;
        let cached = match read_body(&mut tx, Store::Tasks, &completion.task_id).await? {
            Some(body) => match serde_json::from_str::<CachedTask>(&body) {
                Ok(task) => Some(task),
                Err(err) => {
                    warn!(
                        target: "shiftcheck",
                        event = "enqueue_cached_task_unreadable",
                        task_id = %completion.task_id,
                        error = %err
                    );
                    None
                }
            },
            None => None,
        };

        let entry = PendingCompletion {
            local_id: LocalId::new(),
            task_id: completion.task_id,
            checklist_item_id: completion.checklist_item_id,
            target_status: completion.target_status,
            reason: completion.reason,
            notes: completion.notes,
            base_sync_version: cached.as_ref().map(|t| t.sync_version).unwrap_or(0),
            created_at: now_utc(),
            synced: false,
            attempts: 0,
            last_error: None,
            failed: false,
        };
        insert_entry(&mut tx, &entry).await?;

        if let Some(mut task) = cached {
            let applied = apply_completion(
                &mut task,
                entry.checklist_item_id.as_deref(),
                entry.target_status,
                entry.reason.as_deref(),
                entry.notes.as_deref(),
                entry.created_at,
            );
            if applied {
                write_record(&mut tx, &task).await?;
            } else {
                warn!(
                    target: "shiftcheck",
                    event = "enqueue_item_not_cached",
                    task_id = %entry.task_id,
                    item_id = ?entry.checklist_item_id
                );
            }
        }
        tx.commit().await?;

        info!(
            target: "shiftcheck",
            event = "completion_enqueued",
            local_id = %entry.local_id,
            task_id = %entry.task_id,
            item_id = ?entry.checklist_item_id,
            status = %entry.target_status,
            base_sync_version = entry.base_sync_version
        );
        Ok(entry.local_id)
    }

    /// Up to `max` sendable entries in creation order.
    pub async fn peek_batch(&self, max: usize) -> SyncResult<QueueBatch> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM pending_completions \
             WHERE synced = 0 AND failed = 0 ORDER BY seq LIMIT ?"
        );
        let limit = i64::try_from(max).unwrap_or(i64::MAX);
        let rows: Vec<QueueRow> = sqlx::query_as(&sql).bind(limit).fetch_all(&self.pool).await?;
        let batch = split_rows(rows);
        debug!(
            target: "shiftcheck",
            event = "queue_peek",
            entries = batch.entries.len(),
            corrupt = batch.corrupt.len()
        );
        Ok(batch)
    }

    /// Remove a confirmed entry. Removing an absent entry is a no-op.
    pub async fn mark_synced(&self, local_id: &LocalId) -> SyncResult<()> {
        let mut conn = self.pool.acquire().await?;
        if !remove_entry(&mut conn, local_id).await? {
            debug!(target: "shiftcheck", event = "mark_synced_absent", local_id = %local_id);
        }
        Ok(())
    }

    pub async fn mark_failed(&self, local_id: &LocalId, error: &str, terminal: bool) -> SyncResult<()> {
        let res = sqlx::query(
            "UPDATE pending_completions \
             SET attempts = attempts + 1, last_error = ?, failed = MAX(failed, ?) \
             WHERE local_id = ?",
        )
        .bind(error)
        .bind(i64::from(terminal))
        .bind(local_id.to_string())
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            warn!(target: "shiftcheck", event = "mark_failed_absent", local_id = %local_id);
        }
        Ok(())
    }

    /// Park an undecodable row as a terminal failure so it stops being read.
    pub async fn mark_corrupt(&self, entry: &CorruptEntry) -> SyncResult<()> {
        sqlx::query(
            "UPDATE pending_completions SET failed = 1, attempts = attempts + 1, last_error = ? \
             WHERE seq = ?",
        )
        .bind(entry.to_error().to_string())
        .bind(entry.seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn pending_count(&self) -> SyncResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pending_completions WHERE synced = 0 AND failed = 0",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn failed_count(&self) -> SyncResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_completions WHERE failed = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Terminal failures awaiting a decision from the user.
    pub async fn failed_entries(&self) -> SyncResult<QueueBatch> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM pending_completions WHERE failed = 1 ORDER BY seq"
        );
        let rows: Vec<QueueRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(split_rows(rows))
    }

    /// Every unsynced entry, sendable or failed, in creation order.
    pub async fn all_entries(&self) -> SyncResult<QueueBatch> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM pending_completions WHERE synced = 0 ORDER BY seq"
        );
        let rows: Vec<QueueRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(split_rows(rows))
    }

    /// Drop a row that could not be decoded, addressed by its position.
    pub async fn discard_corrupt(&self, seq: i64) -> SyncResult<bool> {
        let res = sqlx::query("DELETE FROM pending_completions WHERE seq = ?")
            .bind(seq)
            .execute(&self.pool)
            .await?;
        let removed = res.rows_affected() > 0;
        info!(target: "shiftcheck", event = "queue_corrupt_discarded", seq, removed);
        Ok(removed)
    }

    /// Drop an entry at the user's request. Returns whether a row was removed.
    pub async fn discard(&self, local_id: &str) -> SyncResult<bool> {
        let res = sqlx::query("DELETE FROM pending_completions WHERE local_id = ?")
            .bind(local_id)
            .execute(&self.pool)
            .await?;
        let removed = res.rows_affected() > 0;
        info!(target: "shiftcheck", event = "queue_entry_discarded", local_id, removed);
        Ok(removed)
    }

    pub async fn pending_for_task(&self, task_id: &str) -> SyncResult<Vec<PendingCompletion>> {
        let mut conn = self.pool.acquire().await?;
        sendable_for_task(&mut conn, task_id).await
    }
}
