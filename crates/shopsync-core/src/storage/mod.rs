//! Persistent key/value areas shared between browsing contexts
//!
//! A "context" is one running instance of the app (a tab, a window, a CLI
//! process). Writes are visible to every context sharing the area, and each
//! context is told about changes made by its siblings, never its own.

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::{MemoryStorage, SharedMemoryStorage};

use crate::error::SyncResult;
use tokio::sync::broadcast;

/// A value changed in another context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    /// `None` when the key was removed
    pub new_value: Option<String>,
}

/// String key/value storage with sibling change notifications
pub trait StorageArea: Send + Sync {
    fn get(&self, key: &str) -> SyncResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> SyncResult<()>;

    fn remove(&self, key: &str) -> SyncResult<()>;

    /// Changes made by other contexts sharing this area
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

/// Capacity of per-context change channels
pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 64;
