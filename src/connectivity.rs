//! Connectivity Monitor: the observable online/sync state shown by the UI.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub sync_in_progress: bool,
    pub pending_count: u64,
    pub failed_count: u64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub completed_passes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CameOnline,
    WentOffline,
    Unchanged,
}

/// Online flag plus a count of every flip, so observers that wake up late
/// can tell how many transitions they missed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkState {
    pub online: bool,
    pub flips: u64,
}

impl LinkState {
    /// The flips between `earlier` and `self`, oldest first.
    pub fn flips_since(&self, earlier: &LinkState) -> Vec<bool> {
        let missed = self.flips.saturating_sub(earlier.flips);
        (0..missed)
            .map(|i| {
                if (missed - 1 - i) % 2 == 0 {
                    self.online
                } else {
                    !self.online
                }
            })
            .collect()
    }
}

/// Handle to a status observer. Dropping it stops the observer.
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<SyncStatus>>,
    link: Arc<watch::Sender<LinkState>>,
}

impl ConnectivityMonitor {
    pub fn new(is_online: bool) -> Self {
        let (tx, _rx) = watch::channel(SyncStatus {
            is_online,
            ..SyncStatus::default()
        });
        let (link, _rx) = watch::channel(LinkState {
            online: is_online,
            flips: 0,
        });
        Self {
            tx: Arc::new(tx),
            link: Arc::new(link),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.link.borrow().online
    }

    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Flip counter and online flag; every transition bumps `flips`.
    pub fn link(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    pub fn set_online(&self, online: bool) -> Transition {
        let mut transition = Transition::Unchanged;
        self.link.send_if_modified(|link| {
            if link.online == online {
                return false;
            }
            link.online = online;
            link.flips += 1;
            transition = if online {
                Transition::CameOnline
            } else {
                Transition::WentOffline
            };
            true
        });
        if transition == Transition::Unchanged {
            return transition;
        }
        // Mirror the link rather than `online` so racing calls settle on the same value.
        let current = self.link.borrow().online;
        self.tx.send_modify(|status| status.is_online = current);
        info!(target: "shiftcheck", event = "connectivity_changed", online);
        transition
    }

    /// Apply `f` and notify observers only if it reports a change.
    pub fn update(&self, f: impl FnOnce(&mut SyncStatus) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    pub fn set_sync_in_progress(&self, in_progress: bool) {
        self.update(|status| {
            let changed = status.sync_in_progress != in_progress;
            status.sync_in_progress = in_progress;
            changed
        });
    }

    pub fn set_counts(&self, pending: u64, failed: u64) {
        self.update(|status| {
            let changed = status.pending_count != pending || status.failed_count != failed;
            status.pending_count = pending;
            status.failed_count = failed;
            changed
        });
    }

    /// Run `handler` with every new status until the subscription is dropped.
    pub fn on_change<F>(&self, mut handler: F) -> Subscription
    where
        F: FnMut(&SyncStatus) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let status = rx.borrow_and_update().clone();
                handler(&status);
            }
        });
        Subscription { task }
    }

    /// Run `handler` on each online/offline flip, including flips that
    /// happened faster than the handler could observe them.
    pub fn on_connectivity_change<F>(&self, mut handler: F) -> Subscription
    where
        F: FnMut(bool) + Send + 'static,
    {
        let mut rx = self.link.subscribe();
        let mut last = *rx.borrow_and_update();
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let current = *rx.borrow_and_update();
                for online in current.flips_since(&last) {
                    handler(online);
                }
                last = current;
            }
        });
        Subscription { task }
    }
}
