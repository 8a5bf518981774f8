//! Directory-backed storage shared between processes
//!
//! One JSON file per key. Writes go through a temp file and a rename so a
//! sibling never reads a half-written value. Sibling writes are detected with
//! notify; events caused by this handle's own writes are filtered out by
//! comparing against the last content it knows for the key.

use super::{StorageArea, StorageChange, CHANGE_CHANNEL_CAPACITY};
use crate::error::{SyncError, SyncResult};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};

const VALUE_EXTENSION: &str = "json";

/// State shared with the notify callback
struct WatchState {
    dir: PathBuf,
    /// Last content seen per key, `None` once removed
    known: Mutex<HashMap<String, Option<String>>>,
    changes: broadcast::Sender<StorageChange>,
}

impl WatchState {
    fn process_event(&self, event: &Event) {
        let removed = match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => false,
            EventKind::Remove(_) => true,
            _ => return,
        };

        for path in &event.paths {
            let Some(key) = key_for_path(path) else {
                continue;
            };
            trace!(path = %path.display(), "Processing storage file event");

            let current = if removed {
                None
            } else {
                match std::fs::read_to_string(path) {
                    Ok(content) => Some(content),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "Unreadable storage file");
                        continue;
                    }
                }
            };

            let mut known = self.known.lock();
            if known.get(&key) == Some(&current) {
                continue;
            }
            known.insert(key.clone(), current.clone());
            drop(known);

            debug!(key = %key, removed = current.is_none(), "Sibling storage change");
            let _ = self.changes.send(StorageChange {
                key,
                new_value: current,
            });
        }
    }
}

/// Storage area rooted at a directory
pub struct FileStorage {
    state: Arc<WatchState>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileStorage {
    /// Open (creating if needed) the area at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> SyncResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| SyncError::Storage {
            path: dir.clone(),
            source,
        })?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            state: Arc::new(WatchState {
                dir,
                known: Mutex::new(HashMap::new()),
                changes,
            }),
            watcher: Mutex::new(None),
        })
    }

    /// Open and start watching for sibling writes
    pub fn open_watched(dir: impl Into<PathBuf>) -> SyncResult<Self> {
        let storage = Self::open(dir)?;
        storage.watch()?;
        Ok(storage)
    }

    pub fn dir(&self) -> &Path {
        &self.state.dir
    }

    /// Start the notify watcher. Calling it twice is a no-op.
    pub fn watch(&self) -> SyncResult<()> {
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return Ok(());
        }

        let state = Arc::clone(&self.state);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => state.process_event(&event),
                Err(e) => error!(error = %e, "Storage watcher error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| watch_error(&self.state.dir, e))?;

        watcher
            .watch(&self.state.dir, RecursiveMode::NonRecursive)
            .map_err(|e| watch_error(&self.state.dir, e))?;

        info!(dir = %self.state.dir.display(), "Storage watcher started");
        *slot = Some(watcher);
        Ok(())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.state
            .dir
            .join(format!("{}.{}", sanitize_key(key), VALUE_EXTENSION))
    }

    fn io_error(path: &Path, source: std::io::Error) -> SyncError {
        SyncError::Storage {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl StorageArea for FileStorage {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        let path = self.path_for(key);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        let path = self.path_for(key);
        let tmp = self.state.dir.join(format!(".{}.tmp", sanitize_key(key)));

        // Record first so the watcher event for this write is recognised
        self.state
            .known
            .lock()
            .insert(sanitize_key(key), Some(value.to_string()));

        std::fs::write(&tmp, value).map_err(|e| Self::io_error(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| Self::io_error(&path, e))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        let path = self.path_for(key);
        self.state.known.lock().insert(sanitize_key(key), None);

        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.state.changes.subscribe()
    }
}

fn watch_error(dir: &Path, e: notify::Error) -> SyncError {
    SyncError::Storage {
        path: dir.to_path_buf(),
        source: std::io::Error::other(e.to_string()),
    }
}

/// Keys become file names: anything outside `[A-Za-z0-9_.-]` maps to `_`
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn key_for_path(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some(VALUE_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.starts_with('.') {
        return None;
    }
    Some(stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_set_get_remove() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();

        assert_eq!(storage.get("read_notifications").unwrap(), None);
        storage.set("read_notifications", "[\"n1\"]").unwrap();
        assert_eq!(
            storage.get("read_notifications").unwrap().as_deref(),
            Some("[\"n1\"]")
        );
        assert!(dir.path().join("read_notifications.json").exists());

        storage.remove("read_notifications").unwrap();
        assert_eq!(storage.get("read_notifications").unwrap(), None);
        // Removing a missing key is fine
        storage.remove("read_notifications").unwrap();
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempdir().unwrap();
        FileStorage::open(dir.path())
            .unwrap()
            .set("dismissed_notifications", "[\"n2\"]")
            .unwrap();

        let reopened = FileStorage::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get("dismissed_notifications").unwrap().as_deref(),
            Some("[\"n2\"]")
        );
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("read_notifications"), "read_notifications");
        assert_eq!(sanitize_key("a/b c"), "a_b_c");
    }

    #[test]
    fn test_key_for_path_ignores_temp_and_foreign_files() {
        assert_eq!(
            key_for_path(Path::new("/x/read_notifications.json")).as_deref(),
            Some("read_notifications")
        );
        assert_eq!(key_for_path(Path::new("/x/.read_notifications.tmp")), None);
        assert_eq!(key_for_path(Path::new("/x/notes.txt")), None);
    }

    #[test]
    fn test_own_write_is_filtered() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        let mut rx = storage.subscribe();
        storage.set("k", "v").unwrap();

        let path = dir.path().join("k.json");
        storage
            .state
            .process_event(&Event::new(EventKind::Create(notify::event::CreateKind::File)).add_path(path));

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_sibling_write_is_reported_once() {
        let dir = tempdir().unwrap();
        let tab_a = FileStorage::open(dir.path()).unwrap();
        let tab_b = FileStorage::open(dir.path()).unwrap();
        let mut rx_b = tab_b.subscribe();

        tab_a.set("k", "v1").unwrap();
        let event = Event::new(EventKind::Modify(notify::event::ModifyKind::Any))
            .add_path(dir.path().join("k.json"));
        tab_b.state.process_event(&event);
        // Duplicate notify event for the same write
        tab_b.state.process_event(&event);

        let change = rx_b.try_recv().unwrap();
        assert_eq!(change.key, "k");
        assert_eq!(change.new_value.as_deref(), Some("v1"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watcher_reports_sibling_writes() {
        let dir = tempdir().unwrap();
        let tab_a = FileStorage::open(dir.path()).unwrap();
        let tab_b = FileStorage::open_watched(dir.path()).unwrap();
        let mut rx_b = tab_b.subscribe();

        tab_a.set("read_notifications", "[\"n1\"]").unwrap();

        let change = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx_b.recv().await {
                    Ok(change) if change.key == "read_notifications" => break change,
                    Ok(_) => continue,
                    Err(e) => panic!("watcher channel failed: {e}"),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(change.new_value.as_deref(), Some("[\"n1\"]"));
    }
}
