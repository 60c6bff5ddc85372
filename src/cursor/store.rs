use fs2::FileExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::errors::StoreError;

pub type Entries = BTreeMap<String, Value>;

/// Crash-surviving key/value storage for the pipeline cursor.
///
/// Every mutating call must be durable when it returns: the driver relies on
/// a write completing before the step it describes starts running.
pub trait CursorStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Write several keys as one durable update.
    fn set_many(&self, entries: Vec<(String, Value)>) -> Result<(), StoreError>;

    /// Remove every key starting with `prefix`.
    fn remove_prefix(&self, prefix: &str) -> Result<(), StoreError>;

    fn entries(&self) -> Result<Entries, StoreError>;

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.set_many(vec![(key.to_string(), value)])
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.remove_prefix("")
    }
}

/// JSON-file backed store.
///
/// Writes go to a temp file, are fsynced, then renamed over the store file so
/// a kill mid-write leaves either the old or the new contents. An exclusive
/// lock on a sidecar `.lock` file keeps two orchestrators off the same store.
pub struct FileCursorStore {
    path: PathBuf,
    entries: Mutex<Entries>,
    _lock: File,
}

impl FileCursorStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with(path.into(), false)
    }

    /// Like [`open`](Self::open), but an unparseable store file is deleted
    /// and the store starts empty instead of failing.
    pub fn open_discarding_corrupt(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with(path.into(), true)
    }

    fn open_with(path: PathBuf, discard_corrupt: bool) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let lock_path = path.with_extension("lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| StoreError::Io {
                path: lock_path.clone(),
                source,
            })?;
        lock.try_lock_exclusive()
            .map_err(|_| StoreError::Locked { path: path.clone() })?;

        let entries = match Self::read_entries(&path) {
            Err(StoreError::Corrupt { message, .. }) if discard_corrupt => {
                tracing::warn!(path = %path.display(), %message, "discarding unreadable cursor store");
                fs::remove_file(&path).map_err(|source| StoreError::Io {
                    path: path.clone(),
                    source,
                })?;
                Entries::new()
            }
            other => other?,
        };
        tracing::debug!(path = %path.display(), keys = entries.len(), "opened cursor store");

        Ok(Self {
            path,
            entries: Mutex::new(entries),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the store's contents without taking the lock.
    pub fn snapshot(path: &Path) -> Result<Entries, StoreError> {
        Self::read_entries(path)
    }

    fn read_entries(path: &Path) -> Result<Entries, StoreError> {
        if !path.exists() {
            return Ok(Entries::new());
        }
        let content = fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(Entries::new());
        }
        serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    fn persist(&self, entries: &Entries) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if entries.is_empty() {
            if self.path.exists() {
                fs::remove_file(&self.path).map_err(io_err)?;
            }
            return Ok(());
        }

        let content = serde_json::to_vec_pretty(entries).map_err(|source| {
            StoreError::Serialize {
                key: "*".to_string(),
                source,
            }
        })?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = File::create(&temp_path).map_err(io_err)?;
        file.write_all(&content).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&temp_path, &self.path).map_err(io_err)?;
        Ok(())
    }

    fn update(&self, mutate: impl FnOnce(&mut Entries)) -> Result<(), StoreError> {
        let mut guard = self.entries.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut next = guard.clone();
        mutate(&mut next);
        self.persist(&next)?;
        *guard = next;
        Ok(())
    }
}

impl CursorStore for FileCursorStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let guard = self.entries.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(guard.get(key).cloned())
    }

    fn set_many(&self, entries: Vec<(String, Value)>) -> Result<(), StoreError> {
        self.update(|map| map.extend(entries))
    }

    fn remove_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        self.update(|map| map.retain(|k, _| !k.starts_with(prefix)))
    }

    fn entries(&self) -> Result<Entries, StoreError> {
        let guard = self.entries.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(guard.clone())
    }
}

/// In-process store, durable only for the lifetime of the value.
///
/// Share it behind an `Arc` to simulate restarts in tests.
#[derive(Default)]
pub struct MemoryCursorStore {
    entries: Mutex<Entries>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Entries) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }
}

impl CursorStore for MemoryCursorStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let guard = self.entries.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(guard.get(key).cloned())
    }

    fn set_many(&self, entries: Vec<(String, Value)>) -> Result<(), StoreError> {
        let mut guard = self.entries.lock().map_err(|_| StoreError::LockPoisoned)?;
        guard.extend(entries);
        Ok(())
    }

    fn remove_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let mut guard = self.entries.lock().map_err(|_| StoreError::LockPoisoned)?;
        guard.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    fn entries(&self) -> Result<Entries, StoreError> {
        let guard = self.entries.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(guard.clone())
    }
}
