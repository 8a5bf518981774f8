//! Persisted notification flags
//!
//! Two sets of notification ids, stored as JSON arrays under
//! `read_notifications` and `dismissed_notifications`. Unreadable data
//! degrades to an empty set and is overwritten with `[]` so the next load is
//! clean.

use crate::error::{SyncError, SyncResult};
use crate::storage::{StorageArea, StorageChange};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const READ_KEY: &str = "read_notifications";
pub const DISMISSED_KEY: &str = "dismissed_notifications";

/// Which flag set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagKind {
    Read,
    Dismissed,
}

impl FlagKind {
    pub const ALL: [FlagKind; 2] = [FlagKind::Read, FlagKind::Dismissed];

    pub fn key(self) -> &'static str {
        match self {
            FlagKind::Read => READ_KEY,
            FlagKind::Dismissed => DISMISSED_KEY,
        }
    }

    /// Flag set stored under `key`, if any
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            READ_KEY => Some(FlagKind::Read),
            DISMISSED_KEY => Some(FlagKind::Dismissed),
            _ => None,
        }
    }
}

/// Read/dismissed id sets on top of a storage area
#[derive(Clone)]
pub struct FlagStore {
    storage: Arc<dyn StorageArea>,
}

impl FlagStore {
    pub fn new(storage: Arc<dyn StorageArea>) -> Self {
        Self { storage }
    }

    /// Load a flag set. Never fails: missing data is empty, corrupted data is
    /// reset to empty.
    pub fn load(&self, kind: FlagKind) -> BTreeSet<String> {
        match self.try_load(kind) {
            Ok(set) => set,
            Err(SyncError::StorageCorruption { key, message }) => {
                warn!(key = %key, error = %message, "Corrupted flag set, resetting to empty");
                if let Err(e) = self.save(kind, &BTreeSet::new()) {
                    warn!(key = %key, error = %e, "Failed to reset corrupted flag set");
                }
                BTreeSet::new()
            }
            Err(e) => {
                warn!(key = kind.key(), error = %e, "Failed to read flag set");
                BTreeSet::new()
            }
        }
    }

    fn try_load(&self, kind: FlagKind) -> SyncResult<BTreeSet<String>> {
        let Some(raw) = self.storage.get(kind.key())? else {
            return Ok(BTreeSet::new());
        };
        parse_flag_set(&raw).map_err(|message| SyncError::StorageCorruption {
            key: kind.key().to_string(),
            message,
        })
    }

    fn save(&self, kind: FlagKind, set: &BTreeSet<String>) -> SyncResult<()> {
        let encoded = serde_json::to_string(set)
            .map_err(|e| SyncError::malformed(kind.key(), e.to_string()))?;
        self.storage.set(kind.key(), &encoded)
    }

    /// Add ids to a flag set.
    ///
    /// The persisted set is re-read first so ids written by sibling contexts
    /// are kept. Returns the merged set; nothing is written when every id was
    /// already present.
    pub fn insert<I, S>(&self, kind: FlagKind, ids: I) -> SyncResult<BTreeSet<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = self.load(kind);
        let before = set.len();
        set.extend(ids.into_iter().map(Into::into));

        if set.len() != before {
            self.save(kind, &set)?;
            debug!(key = kind.key(), added = set.len() - before, "Flag set updated");
        }
        Ok(set)
    }

    /// Forget both flag sets (logout, explicit reset)
    pub fn clear(&self) -> SyncResult<()> {
        for kind in FlagKind::ALL {
            self.storage.remove(kind.key())?;
        }
        Ok(())
    }

    /// Changes made by sibling contexts to the underlying area
    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.storage.subscribe()
    }
}

fn parse_flag_set(raw: &str) -> Result<BTreeSet<String>, String> {
    serde_json::from_str::<Vec<String>>(raw)
        .map(|ids| ids.into_iter().collect())
        .map_err(|e| e.to_string())
}
