#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use shiftcheck_lib::remote::{RemoteError, RemoteTaskService};
use shiftcheck_lib::{
    CachedTask, IndexFilter, ItemStatus, NewCompletion, OfflineSync, PassOutcome, SyncNotice,
    TargetStatus, Transition,
};

#[path = "util.rs"]
mod util;

use util::FakeTaskService;

const WAIT: Duration = Duration::from_secs(5);

async fn client(fake: &Arc<FakeTaskService>, online: bool) -> (tempfile::TempDir, OfflineSync) {
    let (dir, pool) = util::temp_db().await;
    let remote: Arc<dyn RemoteTaskService> = fake.clone();
    let client = OfflineSync::start(pool, remote, util::test_config(), online).await;
    (dir, client)
}

#[tokio::test]
async fn offline_burst_syncs_once_when_connectivity_returns() -> Result<()> {
    let task = util::sample_task(
        "t-1",
        "kitchen",
        1,
        &[
            ("i-1", ItemStatus::Pending),
            ("i-2", ItemStatus::Pending),
            ("i-3", ItemStatus::Pending),
        ],
    );
    let fake = FakeTaskService::with_tasks([task.clone()]);
    let (_dir, client) = client(&fake, false).await;
    client.cache().put(&task).await?;

    for item in ["i-1", "i-2", "i-3"] {
        client
            .enqueue_completion(NewCompletion::item("t-1", item, TargetStatus::Ok))
            .await?;
    }
    assert_eq!(client.status().pending_count, 3);
    assert!(fake.submissions().is_empty());

    // Flapping inside the debounce window collapses into one edge.
    assert_eq!(client.set_online(true), Transition::CameOnline);
    assert_eq!(client.set_online(true), Transition::Unchanged);
    client.set_online(false);
    client.set_online(true);

    let status = util::wait_for_status(&client, WAIT, |s| s.completed_passes >= 1 && !s.sync_in_progress).await;
    assert_eq!(status.pending_count, 0);
    assert!(status.last_synced_at.is_some());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.status().completed_passes, 1);

    let sent: Vec<(Option<String>, i64)> = fake
        .submissions()
        .into_iter()
        .map(|s| (s.item_id, s.expected_version))
        .collect();
    assert_eq!(
        sent,
        vec![
            (Some("i-1".to_string()), 1),
            (Some("i-2".to_string()), 2),
            (Some("i-3".to_string()), 3),
        ]
    );
    let cached: CachedTask = client.task("t-1").await?.unwrap();
    assert_eq!(cached.sync_version, 4);
    assert!(!cached.optimistic);

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn sync_now_while_offline_does_nothing() -> Result<()> {
    let fake = FakeTaskService::with_tasks([util::sample_task("t-1", "kitchen", 1, &[])]);
    let (_dir, client) = client(&fake, false).await;
    client
        .enqueue_completion(NewCompletion::task("t-1", TargetStatus::Ok))
        .await?;

    assert_eq!(client.force_sync_now().await?, PassOutcome::Offline);
    assert!(fake.submissions().is_empty());
    assert_eq!(client.status().completed_passes, 0);
    assert_eq!(client.pending_entries().await?.len(), 1);

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_sync_requests_send_each_entry_once() -> Result<()> {
    let fake = FakeTaskService::with_tasks([util::sample_task("t-1", "kitchen", 1, &[])]);
    let (_dir, client) = client(&fake, false).await;
    client
        .enqueue_completion(NewCompletion::task("t-1", TargetStatus::Ok))
        .await?;
    client.set_online(true);

    let (a, b) = tokio::join!(client.force_sync_now(), client.force_sync_now());
    let outcomes = [a?, b?];
    assert!(outcomes.iter().any(|o| matches!(o, PassOutcome::Completed(_))));
    assert_eq!(fake.submissions().len(), 1);
    assert_eq!(client.status().pending_count, 0);

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn transient_failure_is_retried_with_backoff() -> Result<()> {
    let fake = FakeTaskService::with_tasks([util::sample_task("t-1", "kitchen", 1, &[])]);
    fake.script([Some(RemoteError::Network("connection reset".into()))]);
    let (_dir, client) = client(&fake, true).await;

    client
        .enqueue_completion(NewCompletion::task("t-1", TargetStatus::Problem).with_reason("broken tap"))
        .await?;

    let status = util::wait_for_status(&client, WAIT, |s| {
        s.pending_count == 0 && s.last_error.is_none() && s.last_synced_at.is_some()
    })
    .await;
    assert!(status.completed_passes >= 2);
    assert_eq!(fake.submissions().len(), 2);
    assert!(fake.task("t-1").unwrap().is_completed());

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn rejected_entry_can_be_discarded() -> Result<()> {
    let task = util::sample_task("t-1", "kitchen", 1, &[("i-1", ItemStatus::Pending)]);
    let fake = FakeTaskService::with_tasks([task.clone()]);
    fake.script([Some(RemoteError::Rejected {
        status: 422,
        message: "reason required".into(),
    })]);
    let (_dir, client) = client(&fake, false).await;
    client.cache().put(&task).await?;
    let mut notices = client.notices();

    let local_id = client
        .enqueue_completion(NewCompletion::item("t-1", "i-1", TargetStatus::Problem))
        .await?;
    client.set_online(true);
    let outcome = client.force_sync_now().await?;
    let report = match outcome {
        PassOutcome::Completed(report) => report,
        other => panic!("expected a pass, got {other:?}"),
    };
    assert_eq!(report.rejected, 1);
    assert!(matches!(notices.recv().await?, SyncNotice::Rejected { .. }));

    let failed = client.failed_entries().await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].local_id, local_id);
    assert_eq!(client.status().failed_count, 1);

    assert!(client.discard_failed(&local_id).await?);
    util::wait_for_status(&client, WAIT, |s| s.failed_count == 0).await;
    assert!(client.failed_entries().await?.is_empty());

    let cached: CachedTask = client.task("t-1").await?.unwrap();
    assert_eq!(cached.item("i-1").unwrap().status, ItemStatus::Pending);

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn reads_fall_back_to_remote_when_cache_is_unavailable() -> Result<()> {
    let fake = FakeTaskService::with_tasks([
        util::sample_task("t-1", "kitchen", 1, &[]),
        util::sample_task("t-2", "bar", 1, &[]),
    ]);
    let (_dir, client) = client(&fake, false).await;
    client.cache().pool().close().await;

    let tasks = client
        .tasks(Some(&IndexFilter::TaskArea("bar".into())))
        .await?;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, "t-2");
    assert!(client.task("t-1").await?.is_some());
    assert_eq!(fake.fetch_task_calls(), 1);

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn reconnect_during_a_failing_pass_runs_a_fresh_pass() -> Result<()> {
    let task = util::sample_task("t-1", "kitchen", 1, &[("i-1", ItemStatus::Pending)]);
    let fake = FakeTaskService::with_tasks([task.clone()]);
    fake.set_offline(true);
    fake.set_submit_delay(Some(Duration::from_millis(300)));
    let (_dir, pool) = util::temp_db().await;
    let remote: Arc<dyn RemoteTaskService> = fake.clone();
    let config = shiftcheck_lib::SyncConfig {
        retry_base_ms: 10_000,
        retry_max_ms: 20_000,
        ..util::test_config()
    };
    let client = OfflineSync::start(pool, remote, config, false).await;
    client.cache().put(&task).await?;
    client
        .enqueue_completion(NewCompletion::item("t-1", "i-1", TargetStatus::Ok))
        .await?;

    client.set_online(true);
    util::wait_for_status(&client, WAIT, |s| s.sync_in_progress).await;
    // The link drops and returns while the submission is still in flight.
    fake.set_offline(false);
    client.set_online(false);
    client.set_online(true);

    // Recovery must not wait for the 10s retry backoff.
    let status = util::wait_for_status(&client, Duration::from_secs(3), |s| {
        s.pending_count == 0 && !s.sync_in_progress
    })
    .await;
    assert_eq!(status.failed_count, 0);
    assert_eq!(fake.submissions().len(), 1);
    assert_eq!(fake.task("t-1").unwrap().item("i-1").unwrap().status, ItemStatus::Ok);

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn corrupt_queue_rows_are_surfaced_and_discardable() -> Result<()> {
    let fake = FakeTaskService::new();
    let (_dir, pool) = util::temp_db().await;
    sqlx::query(
        "INSERT INTO pending_completions \
         (local_id, task_id, checklist_item_id, target_status, base_sync_version, created_at) \
         VALUES ('not-a-uuid', 't-2', NULL, 'done', 0, 'yesterday')",
    )
    .execute(&pool)
    .await?;
    let remote: Arc<dyn RemoteTaskService> = fake.clone();
    let client = OfflineSync::start(pool, remote, util::test_config(), false).await;

    client.set_online(true);
    let report = match client.force_sync_now().await? {
        PassOutcome::Completed(report) => report,
        other => panic!("expected a pass, got {other:?}"),
    };
    assert_eq!(report.corrupt, 1);
    util::wait_for_status(&client, WAIT, |s| s.failed_count == 1).await;
    assert!(client.failed_entries().await?.is_empty());

    let corrupt = client.corrupt_entries().await?;
    assert_eq!(corrupt.len(), 1);
    assert_eq!(corrupt[0].local_id, "not-a-uuid");

    assert!(client.discard_corrupt(&corrupt[0]).await?);
    util::wait_for_status(&client, WAIT, |s| s.failed_count == 0).await;
    assert!(client.corrupt_entries().await?.is_empty());
    assert!(!client.discard_corrupt(&corrupt[0]).await?);

    client.shutdown().await;
    Ok(())
}
