//! The actor that owns the `{Idle, Syncing}` phase and decides when passes run.
//!
//! Everything that can start a pass (connectivity edges, enqueues, manual
//! requests, backoff timers) arrives here as a message, so at most one pass is
//! ever in flight. Requests that arrive while a pass runs are coalesced into it.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::engine::{PassReport, SyncEngine};
use crate::error::{SyncError, SyncResult};

const COMMAND_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Syncing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Enqueued,
    CameOnline,
    Manual,
    Retry,
    FollowUp,
}

impl TriggerReason {
    fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::Enqueued => "enqueued",
            TriggerReason::CameOnline => "came_online",
            TriggerReason::Manual => "manual",
            TriggerReason::Retry => "retry",
            TriggerReason::FollowUp => "follow_up",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassReport),
    /// A pass was already running and covered this request.
    Coalesced,
    /// The device is offline; nothing was attempted.
    Offline,
}

type Reply = oneshot::Sender<SyncResult<PassOutcome>>;

pub enum SyncCommand {
    Trigger(TriggerReason),
    SyncNow(Reply),
    Shutdown,
}

#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncCommand>,
}

impl SyncHandle {
    /// Ask for a pass without waiting. A full channel already holds a
    /// request that will cover this one.
    pub fn trigger(&self, reason: TriggerReason) {
        if self.tx.try_send(SyncCommand::Trigger(reason)).is_err() {
            debug!(target: "shiftcheck", event = "sync_trigger_dropped", reason = reason.as_str());
        }
    }

    pub async fn sync_now(&self) -> SyncResult<PassOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SyncCommand::SyncNow(reply))
            .await
            .map_err(|_| worker_stopped())?;
        rx.await.map_err(|_| worker_stopped())?
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(SyncCommand::Shutdown).await;
    }
}

fn worker_stopped() -> SyncError {
    SyncError::validation("sync worker is not running")
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

pub struct SyncWorker {
    engine: Arc<SyncEngine>,
    monitor: ConnectivityMonitor,
    rx: mpsc::Receiver<SyncCommand>,
    phase: SyncPhase,
    config: SyncConfig,
    failures: u32,
    retry_at: Option<Instant>,
    stopping: bool,
}

impl SyncWorker {
    pub fn spawn(
        engine: Arc<SyncEngine>,
        monitor: ConnectivityMonitor,
        config: SyncConfig,
    ) -> (SyncHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let worker = SyncWorker {
            engine,
            monitor,
            rx,
            phase: SyncPhase::Idle,
            config,
            failures: 0,
            retry_at: None,
            stopping: false,
        };
        let task = tokio::spawn(worker.run());
        (SyncHandle { tx }, task)
    }

    async fn run(mut self) {
        let mut link_rx = self.monitor.link();
        let debounce = self.config.online_debounce();
        // Starting online counts as coming online.
        let mut seen = *link_rx.borrow_and_update();
        let mut online_at = seen.online.then(|| Instant::now() + debounce);

        while !self.stopping {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        None | Some(SyncCommand::Shutdown) => break,
                        Some(SyncCommand::Trigger(reason)) => self.run_cycle(reason, None).await,
                        Some(SyncCommand::SyncNow(reply)) => {
                            self.run_cycle(TriggerReason::Manual, Some(reply)).await
                        }
                    }
                    // A pass that just ran covers an online edge seen before it.
                    online_at = None;
                },
                changed = link_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // Compare flip counts, not flags: an offline/online round
                    // trip during a pass still leaves the counter moved.
                    let link = *link_rx.borrow_and_update();
                    let came_online = link.flips_since(&seen).contains(&true);
                    seen = link;
                    if !link.online {
                        online_at = None;
                    } else if came_online {
                        online_at = Some(Instant::now() + debounce);
                    }
                },
                _ = sleep_until_opt(online_at), if online_at.is_some() => {
                    online_at = None;
                    self.run_cycle(TriggerReason::CameOnline, None).await;
                },
                _ = sleep_until_opt(self.retry_at), if self.retry_at.is_some() => {
                    self.retry_at = None;
                    self.run_cycle(TriggerReason::Retry, None).await;
                },
            }
        }
        info!(target: "shiftcheck", event = "sync_worker_stopped");
    }

    /// Run a pass, then follow-up passes while sendable entries remain.
    async fn run_cycle(&mut self, reason: TriggerReason, mut reply: Option<Reply>) {
        if !self.monitor.is_online() {
            debug!(target: "shiftcheck", event = "sync_skipped_offline", reason = reason.as_str());
            if let Some(reply) = reply.take() {
                let _ = reply.send(Ok(PassOutcome::Offline));
            }
            return;
        }

        let mut reason = reason;
        loop {
            debug_assert_eq!(self.phase, SyncPhase::Idle);
            self.phase = SyncPhase::Syncing;
            self.monitor.set_sync_in_progress(true);
            info!(target: "shiftcheck", event = "sync_pass_triggered", reason = reason.as_str());

            let result = self.engine.run_pass().await;
            let coalesced = self.drain_commands();
            self.publish(&result).await;
            self.phase = SyncPhase::Idle;

            let outcome = result.clone().map(PassOutcome::Completed);
            if let Some(reply) = reply.take() {
                let _ = reply.send(outcome);
            }
            for waiter in coalesced {
                let _ = waiter.send(Ok(PassOutcome::Coalesced));
            }

            let failed = match &result {
                Ok(report) => report.is_halted(),
                Err(_) => true,
            };
            if failed {
                self.failures = self.failures.saturating_add(1);
                let delay = self.config.backoff(self.failures);
                self.retry_at = Some(Instant::now() + delay);
                warn!(
                    target: "shiftcheck",
                    event = "sync_retry_scheduled",
                    failures = self.failures,
                    delay_ms = delay.as_millis() as u64
                );
                return;
            }
            self.failures = 0;
            self.retry_at = None;

            if self.stopping || !self.monitor.is_online() || !self.has_sendable().await {
                return;
            }
            reason = TriggerReason::FollowUp;
        }
    }

    /// Take everything queued while the pass ran. Triggers are covered by the
    /// pass; manual requests are answered as coalesced.
    fn drain_commands(&mut self) -> Vec<Reply> {
        let mut waiters = Vec::new();
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                SyncCommand::Trigger(_) => {}
                SyncCommand::SyncNow(reply) => waiters.push(reply),
                SyncCommand::Shutdown => self.stopping = true,
            }
        }
        if !waiters.is_empty() {
            debug!(target: "shiftcheck", event = "sync_requests_coalesced", count = waiters.len());
        }
        waiters
    }

    async fn has_sendable(&self) -> bool {
        match self.engine.queue().pending_count().await {
            Ok(count) => count > 0,
            Err(err) => {
                warn!(target: "shiftcheck", event = "pending_count_failed", error = %err);
                false
            }
        }
    }

    async fn publish(&self, result: &SyncResult<PassReport>) {
        let queue = self.engine.queue();
        let pending = queue.pending_count().await.ok();
        let failed = queue.failed_count().await.ok();
        self.monitor.update(|status| {
            status.sync_in_progress = false;
            status.completed_passes += 1;
            if let Some(pending) = pending {
                status.pending_count = pending;
            }
            if let Some(failed) = failed {
                status.failed_count = failed;
            }
            match result {
                Ok(report) if !report.is_halted() => {
                    status.last_synced_at = report.started_at;
                    status.last_error = None;
                }
                Ok(report) => status.last_error = report.halted.clone(),
                Err(err) => status.last_error = Some(err.to_string()),
            }
            true
        });
    }
}
