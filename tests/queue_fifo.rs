#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use proptest::prelude::*;

use shiftcheck_lib::{
    CachedTask, ItemStatus, LocalCache, LocalId, NewCompletion, PendingQueue, SyncError,
    TargetStatus, TaskStatus,
};

#[path = "util.rs"]
mod util;

#[tokio::test]
async fn enqueue_applies_optimistic_effect() -> Result<()> {
    let (_dir, pool) = util::temp_db().await;
    let cache = LocalCache::new(pool.clone());
    let queue = PendingQueue::new(pool);
    cache
        .put(&util::sample_task("t-1", "kitchen", 3, &[("i-1", ItemStatus::Pending)]))
        .await?;

    let id = queue
        .enqueue(NewCompletion::item("t-1", "i-1", TargetStatus::Problem).with_reason("warm"))
        .await?;

    let task: CachedTask = cache.get("t-1").await?.unwrap();
    assert_eq!(task.sync_version, 4);
    assert!(task.optimistic);
    let item = task.item("i-1").unwrap();
    assert_eq!(item.status, ItemStatus::Problem);
    assert_eq!(item.reason.as_deref(), Some("warm"));

    let batch = queue.peek_batch(10).await?;
    assert_eq!(batch.entries.len(), 1);
    let entry = &batch.entries[0];
    assert_eq!(entry.local_id, id);
    assert_eq!(entry.base_sync_version, 3);
    assert_eq!(entry.attempts, 0);
    assert!(!entry.failed);
    Ok(())
}

#[tokio::test]
async fn enqueue_without_cached_task_uses_version_zero() -> Result<()> {
    let (_dir, pool) = util::temp_db().await;
    let queue = PendingQueue::new(pool.clone());
    queue.enqueue(NewCompletion::task("unknown", TargetStatus::Completed)).await?;
    let batch = queue.peek_batch(10).await?;
    assert_eq!(batch.entries[0].base_sync_version, 0);
    assert!(LocalCache::new(pool).get::<CachedTask>("unknown").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn enqueue_survives_an_unreadable_cached_task() -> Result<()> {
    let (_dir, pool) = util::temp_db().await;
    let cache = LocalCache::new(pool.clone());
    let queue = PendingQueue::new(pool.clone());
    cache
        .put(&util::sample_task("t-1", "kitchen", 4, &[("i-1", ItemStatus::Pending)]))
        .await?;
    sqlx::query("UPDATE tasks SET body = '{not json' WHERE id = 't-1'")
        .execute(&pool)
        .await?;

    let id = queue
        .enqueue(NewCompletion::item("t-1", "i-1", TargetStatus::Ok))
        .await?;

    assert_eq!(queue.pending_count().await?, 1);
    let entries = queue.peek_batch(10).await?.entries;
    assert_eq!(entries[0].local_id, id);
    assert_eq!(entries[0].base_sync_version, 0);
    // The unreadable row is left for the next refresh to replace.
    let body: String = sqlx::query_scalar("SELECT body FROM tasks WHERE id = 't-1'")
        .fetch_one(&pool)
        .await?;
    assert_eq!(body, "{not json");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enqueues_on_one_task_all_land() -> Result<()> {
    let (_dir, pool) = util::temp_db().await;
    let cache = LocalCache::new(pool.clone());
    let queue = PendingQueue::new(pool);
    cache.put(&util::sample_task("t-1", "kitchen", 1, &[])).await?;

    let handles: Vec<_> = (0..40)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(NewCompletion::task("t-1", TargetStatus::Ok))
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await??;
    }

    assert_eq!(queue.pending_count().await?, 40);
    let task: CachedTask = cache.get("t-1").await?.unwrap();
    assert_eq!(task.sync_version, 41);
    let mut bases: Vec<i64> = queue
        .peek_batch(40)
        .await?
        .entries
        .iter()
        .map(|e| e.base_sync_version)
        .collect();
    bases.sort_unstable();
    assert_eq!(bases, (1..=40).collect::<Vec<i64>>());
    Ok(())
}

#[tokio::test]
async fn whole_task_completion_marks_task_completed() -> Result<()> {
    let (_dir, pool) = util::temp_db().await;
    let cache = LocalCache::new(pool.clone());
    let queue = PendingQueue::new(pool);
    cache.put(&util::sample_task("t-1", "kitchen", 2, &[])).await?;
    queue.enqueue(NewCompletion::task("t-1", TargetStatus::Ok)).await?;
    let task: CachedTask = cache.get("t-1").await?.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.sync_version, 3);
    Ok(())
}

#[tokio::test]
async fn completed_is_rejected_for_items() -> Result<()> {
    let (_dir, pool) = util::temp_db().await;
    let queue = PendingQueue::new(pool);
    let err = queue
        .enqueue(NewCompletion::item("t-1", "i-1", TargetStatus::Completed))
        .await
        .unwrap_err();
    assert_eq!(err.code(), SyncError::VALIDATION_CODE);
    assert_eq!(queue.pending_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn mark_synced_is_idempotent() -> Result<()> {
    let (_dir, pool) = util::temp_db().await;
    let queue = PendingQueue::new(pool);
    let id = queue.enqueue(NewCompletion::task("t-1", TargetStatus::Ok)).await?;

    queue.mark_synced(&id).await?;
    queue.mark_synced(&id).await?;
    queue.mark_synced(&LocalId::new()).await?;
    assert_eq!(queue.pending_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn terminal_failures_stay_visible_until_discarded() -> Result<()> {
    let (_dir, pool) = util::temp_db().await;
    let queue = PendingQueue::new(pool);
    let first = queue.enqueue(NewCompletion::task("t-1", TargetStatus::Ok)).await?;
    let second = queue.enqueue(NewCompletion::task("t-2", TargetStatus::Ok)).await?;

    queue.mark_failed(&first, "network: reset", false).await?;
    let batch = queue.peek_batch(10).await?;
    assert_eq!(batch.entries[0].local_id, first);
    assert_eq!(batch.entries[0].attempts, 1);
    assert_eq!(batch.entries[0].last_error.as_deref(), Some("network: reset"));

    queue.mark_failed(&first, "not found: task t-1", true).await?;
    let batch = queue.peek_batch(10).await?;
    assert_eq!(batch.entries.len(), 1);
    assert_eq!(batch.entries[0].local_id, second);
    assert_eq!(queue.failed_count().await?, 1);

    let failed = queue.failed_entries().await?;
    assert_eq!(failed.entries[0].local_id, first);
    assert_eq!(failed.entries[0].attempts, 2);

    assert!(queue.discard(&first.to_string()).await?);
    assert!(!queue.discard(&first.to_string()).await?);
    assert_eq!(queue.failed_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn corrupt_rows_are_reported_and_skipped() -> Result<()> {
    let (_dir, pool) = util::temp_db().await;
    let queue = PendingQueue::new(pool.clone());
    let good = queue.enqueue(NewCompletion::task("t-1", TargetStatus::Ok)).await?;
    sqlx::query(
        "INSERT INTO pending_completions \
         (local_id, task_id, checklist_item_id, target_status, base_sync_version, created_at) \
         VALUES ('not-a-uuid', 't-2', NULL, 'done', 0, 'yesterday')",
    )
    .execute(&pool)
    .await?;

    let batch = queue.peek_batch(10).await?;
    assert_eq!(batch.entries.len(), 1);
    assert_eq!(batch.entries[0].local_id, good);
    assert_eq!(batch.corrupt.len(), 1);
    assert_eq!(batch.corrupt[0].local_id, "not-a-uuid");
    assert_eq!(batch.corrupt[0].to_error().code(), SyncError::QUEUE_CORRUPT_CODE);

    queue.mark_corrupt(&batch.corrupt[0]).await?;
    let batch = queue.peek_batch(10).await?;
    assert!(batch.corrupt.is_empty());
    assert_eq!(queue.failed_count().await?, 1);
    Ok(())
}

#[tokio::test]
async fn pending_for_task_lists_only_that_task_in_order() -> Result<()> {
    let (_dir, pool) = util::temp_db().await;
    let queue = PendingQueue::new(pool);
    let a = queue.enqueue(NewCompletion::item("t-1", "i-1", TargetStatus::Ok)).await?;
    queue.enqueue(NewCompletion::item("t-2", "i-1", TargetStatus::Ok)).await?;
    let c = queue.enqueue(NewCompletion::item("t-1", "i-2", TargetStatus::Problem)).await?;

    let ids: Vec<LocalId> = queue
        .pending_for_task("t-1")
        .await?
        .into_iter()
        .map(|e| e.local_id)
        .collect();
    assert_eq!(ids, vec![a, c]);
    Ok(())
}

#[tokio::test]
async fn peek_batch_respects_bound() -> Result<()> {
    let (_dir, pool) = util::temp_db().await;
    let queue = PendingQueue::new(pool);
    for n in 0..5 {
        queue.enqueue(NewCompletion::task(format!("t-{n}"), TargetStatus::Ok)).await?;
    }
    assert_eq!(queue.peek_batch(3).await?.entries.len(), 3);
    assert_eq!(queue.pending_count().await?, 5);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn peek_returns_creation_order(tasks in proptest::collection::vec(0usize..4, 1..12)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (_dir, pool) = util::temp_db().await;
            let queue = PendingQueue::new(pool);
            let mut expected = Vec::new();
            for (n, task) in tasks.iter().enumerate() {
                let completion = NewCompletion::item(format!("t-{task}"), format!("i-{n}"), TargetStatus::Ok);
                expected.push(queue.enqueue(completion).await.unwrap());
            }
            let seen: Vec<LocalId> = queue
                .peek_batch(100)
                .await
                .unwrap()
                .entries
                .into_iter()
                .map(|e| e.local_id)
                .collect();
            prop_assert_eq!(seen, expected);
            Ok(())
        })?;
    }
}
