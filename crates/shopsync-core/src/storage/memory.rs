//! In-process shared storage
//!
//! `SharedMemoryStorage` is the area; `context()` opens one handle per
//! simulated tab. Used by tests and by embedders running several views in
//! one process.

use super::{StorageArea, StorageChange, CHANGE_CHANNEL_CAPACITY};
use crate::error::SyncResult;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Default)]
struct AreaInner {
    values: RwLock<HashMap<String, String>>,
    contexts: Mutex<HashMap<u64, broadcast::Sender<StorageChange>>>,
    next_context: AtomicU64,
}

impl AreaInner {
    fn notify_siblings(&self, origin: u64, change: StorageChange) {
        let contexts = self.contexts.lock();
        for (id, sender) in contexts.iter() {
            if *id != origin {
                let _ = sender.send(change.clone());
            }
        }
    }
}

/// A storage area several contexts can open
#[derive(Clone, Default)]
pub struct SharedMemoryStorage {
    inner: Arc<AreaInner>,
}

impl SharedMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new context on this area
    pub fn context(&self) -> MemoryStorage {
        let id = self.inner.next_context.fetch_add(1, Ordering::Relaxed);
        let (sender, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        self.inner.contexts.lock().insert(id, sender.clone());
        MemoryStorage {
            inner: Arc::clone(&self.inner),
            id,
            changes: sender,
        }
    }
}

/// One context's handle on a `SharedMemoryStorage`
pub struct MemoryStorage {
    inner: Arc<AreaInner>,
    id: u64,
    changes: broadcast::Sender<StorageChange>,
}

impl MemoryStorage {
    pub fn context_id(&self) -> u64 {
        self.id
    }
}

impl StorageArea for MemoryStorage {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.inner.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        let previous = self
            .inner
            .values
            .write()
            .insert(key.to_string(), value.to_string());

        if previous.as_deref() != Some(value) {
            self.inner.notify_siblings(
                self.id,
                StorageChange {
                    key: key.to_string(),
                    new_value: Some(value.to_string()),
                },
            );
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        if self.inner.values.write().remove(key).is_some() {
            self.inner.notify_siblings(
                self.id,
                StorageChange {
                    key: key.to_string(),
                    new_value: None,
                },
            );
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        self.inner.contexts.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_contexts_share_values() {
        let area = SharedMemoryStorage::new();
        let tab_a = area.context();
        let tab_b = area.context();

        tab_a.set("k", "v").unwrap();
        assert_eq!(tab_b.get("k").unwrap().as_deref(), Some("v"));

        tab_b.remove("k").unwrap();
        assert_eq!(tab_a.get("k").unwrap(), None);
    }

    #[test]
    fn test_only_siblings_are_notified() {
        let area = SharedMemoryStorage::new();
        let tab_a = area.context();
        let tab_b = area.context();
        let mut rx_a = tab_a.subscribe();
        let mut rx_b = tab_b.subscribe();

        tab_a.set("read_notifications", "[\"n1\"]").unwrap();

        assert_eq!(rx_a.try_recv().unwrap_err(), TryRecvError::Empty);
        let change = rx_b.try_recv().unwrap();
        assert_eq!(change.key, "read_notifications");
        assert_eq!(change.new_value.as_deref(), Some("[\"n1\"]"));
    }

    #[test]
    fn test_unchanged_write_is_silent() {
        let area = SharedMemoryStorage::new();
        let tab_a = area.context();
        let tab_b = area.context();
        let mut rx_b = tab_b.subscribe();

        tab_a.set("k", "v").unwrap();
        tab_a.set("k", "v").unwrap();

        assert!(rx_b.try_recv().is_ok());
        assert_eq!(rx_b.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn test_dropped_context_unregisters() {
        let area = SharedMemoryStorage::new();
        let tab_a = area.context();
        {
            let _tab_b = area.context();
            assert_eq!(area.inner.contexts.lock().len(), 2);
        }
        assert_eq!(area.inner.contexts.lock().len(), 1);
        tab_a.set("k", "v").unwrap();
    }
}
