//! Notification reconciler
//!
//! Combines the remote notification list with the locally persisted
//! read/dismissed flags into a `NotificationSnapshot`. Snapshots are
//! published on a `watch` channel; every context sharing a storage area
//! converges on the same snapshot for the same remote list.

use crate::error::SyncResult;
use crate::fetch::{Backend, FetchRequest, Fetcher};
use crate::flags::{FlagKind, FlagStore};
use parking_lot::Mutex;
use shopsync_types::{NotificationSnapshot, RemoteNotificationItem};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Backend endpoint listing the user's notifications
pub const NOTIFICATIONS_ENDPOINT: &str = "/api/notifications";

struct CenterState {
    items: Vec<RemoteNotificationItem>,
    read: BTreeSet<String>,
    dismissed: BTreeSet<String>,
    /// Bumped whenever the list stops belonging to the current user
    epoch: u64,
}

impl CenterState {
    fn snapshot(&self) -> NotificationSnapshot {
        NotificationSnapshot::derive(
            &self.items,
            |id| self.read.contains(id),
            |id| self.dismissed.contains(id),
        )
    }
}

/// Per-context notification view
pub struct NotificationCenter {
    flags: FlagStore,
    state: Mutex<CenterState>,
    snapshot: watch::Sender<NotificationSnapshot>,
}

impl NotificationCenter {
    pub fn new(flags: FlagStore) -> Self {
        let state = CenterState {
            items: Vec::new(),
            read: flags.load(FlagKind::Read),
            dismissed: flags.load(FlagKind::Dismissed),
            epoch: 0,
        };
        let (snapshot, _) = watch::channel(state.snapshot());
        Self {
            flags,
            state: Mutex::new(state),
            snapshot,
        }
    }

    pub fn flags(&self) -> &FlagStore {
        &self.flags
    }

    /// Current snapshot
    pub fn snapshot(&self) -> NotificationSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn unread_count(&self) -> usize {
        self.snapshot.borrow().unread_count
    }

    /// Receive every new snapshot
    pub fn subscribe(&self) -> watch::Receiver<NotificationSnapshot> {
        self.snapshot.subscribe()
    }

    /// Incremented by `reset` and `clear`
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Fetch the list from the backend (bypassing the TTL cache) and
    /// reconcile it
    pub async fn refresh<B: Backend>(&self, fetcher: &Fetcher<B>) -> SyncResult<NotificationSnapshot> {
        self.refresh_at(self.epoch(), fetcher).await
    }

    /// Like `refresh`, but the fetched list is only applied if no reset
    /// happened since `epoch` was read. A stale list is dropped and the
    /// current snapshot returned.
    pub async fn refresh_at<B: Backend>(
        &self,
        epoch: u64,
        fetcher: &Fetcher<B>,
    ) -> SyncResult<NotificationSnapshot> {
        let items: Vec<RemoteNotificationItem> = fetcher
            .fetch_fresh(&FetchRequest::get(NOTIFICATIONS_ENDPOINT))
            .await?;

        let mut state = self.state.lock();
        if state.epoch != epoch {
            debug!(
                fetched_at = epoch,
                current = state.epoch,
                "Discarding notification list fetched before a reset"
            );
            return Ok(state.snapshot());
        }
        debug!(count = items.len(), "Fetched notifications");
        state.items = items;
        self.reload_flags(&mut state);
        Ok(self.publish(&state))
    }

    /// Replace the remote list and run a full reconciliation pass
    pub fn apply_remote(&self, items: Vec<RemoteNotificationItem>) -> NotificationSnapshot {
        let mut state = self.state.lock();
        state.items = items;
        self.reload_flags(&mut state);
        self.publish(&state)
    }

    /// Re-read flags and recompute against the in-memory list.
    ///
    /// Run when a sibling context changed the flags.
    pub fn reconcile(&self) -> NotificationSnapshot {
        let mut state = self.state.lock();
        self.reload_flags(&mut state);
        self.publish(&state)
    }

    /// Mark one notification read. Repeated calls change nothing.
    pub fn mark_as_read(&self, id: &str) -> NotificationSnapshot {
        self.set_flag(FlagKind::Read, vec![id.to_string()])
    }

    /// Mark every currently visible notification read
    pub fn mark_all_as_read(&self) -> NotificationSnapshot {
        let ids: Vec<String> = {
            let state = self.state.lock();
            state
                .snapshot()
                .visible
                .iter()
                .filter(|view| !view.is_read)
                .map(|view| view.id().to_string())
                .collect()
        };
        self.set_flag(FlagKind::Read, ids)
    }

    /// Dismiss a notification; it leaves the visible list immediately
    pub fn dismiss(&self, id: &str) -> NotificationSnapshot {
        self.set_flag(FlagKind::Dismissed, vec![id.to_string()])
    }

    fn set_flag(&self, kind: FlagKind, ids: Vec<String>) -> NotificationSnapshot {
        let mut state = self.state.lock();
        let current = match kind {
            FlagKind::Read => &state.read,
            FlagKind::Dismissed => &state.dismissed,
        };
        if ids.iter().all(|id| current.contains(id)) {
            return self.snapshot();
        }

        let merged = match self.flags.insert(kind, ids.iter().cloned()) {
            Ok(merged) => merged,
            Err(e) => {
                // Keep the UI consistent even if persisting failed
                warn!(key = kind.key(), error = %e, "Failed to persist notification flag");
                let mut local = current.clone();
                local.extend(ids);
                local
            }
        };

        match kind {
            FlagKind::Read => state.read = merged,
            FlagKind::Dismissed => state.dismissed = merged,
        }
        self.publish(&state)
    }

    /// Merge a pushed notification: replaces an item with the same id in
    /// place, otherwise goes to the front. The rest of the list keeps the
    /// server's order.
    pub fn apply_created(&self, item: RemoteNotificationItem) -> NotificationSnapshot {
        let mut state = self.state.lock();
        if let Some(existing) = state.items.iter_mut().find(|i| i.id == item.id) {
            *existing = item;
        } else {
            state.items.insert(0, item);
        }
        self.publish(&state)
    }

    /// Drop the remote list but keep the flags (identity switch). Any
    /// refresh still in flight is discarded when it lands.
    pub fn reset(&self) -> NotificationSnapshot {
        let mut state = self.state.lock();
        state.items.clear();
        state.epoch += 1;
        self.publish(&state)
    }

    /// Forget the list and both flag sets (logout)
    pub fn clear(&self) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.items.clear();
        state.read.clear();
        state.dismissed.clear();
        state.epoch += 1;
        self.publish(&state);
        self.flags.clear()
    }

    /// Reconcile whenever a sibling context changes the flag sets
    pub fn spawn_cross_tab_sync(self: &Arc<Self>) -> JoinHandle<()> {
        let center = Arc::clone(self);
        let mut changes = self.flags.subscribe();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        if FlagKind::from_key(&change.key).is_some() {
                            debug!(key = %change.key, "Flags changed in another context");
                            center.reconcile();
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed storage changes, reconciling");
                        center.reconcile();
                    }
                    Err(RecvError::Closed) => {
                        info!("Storage change feed closed");
                        break;
                    }
                }
            }
        })
    }

    fn reload_flags(&self, state: &mut CenterState) {
        state.read = self.flags.load(FlagKind::Read);
        state.dismissed = self.flags.load(FlagKind::Dismissed);
    }

    fn publish(&self, state: &CenterState) -> NotificationSnapshot {
        let snapshot = state.snapshot();
        self.snapshot.send_replace(snapshot.clone());
        snapshot
    }
}
