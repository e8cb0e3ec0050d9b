//! Durable storage: the key-value capability and the local item mirror.
//!
//! [`DurableStore`] abstracts whatever persistent medium the client has.
//! [`LocalMirror`] keeps the whole item collection under a single key as one
//! JSON array, read and written wholesale.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::query::{PaginatedResult, QueryDescriptor, paginate};
use crate::types::{Item, UpdateItemInput};

/// Storage key holding the mirrored item collection.
pub const ITEMS_KEY: &str = "mindo-items";

// ============================================================================
// DurableStore
// ============================================================================

/// Persistent key-value storage that survives restarts.
///
/// Implementations must replace values atomically: a reader sees either the
/// old or the new value, never a partial write.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// One file per key inside a data directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Volatile store for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values().remove(key);
        Ok(())
    }
}

// ============================================================================
// LocalMirror
// ============================================================================

/// Durable client-side copy of the item collection.
///
/// Every call touches storage. Mutating helpers hold an internal lock across
/// their load-modify-save cycle so they never interleave.
#[derive(Clone)]
pub struct LocalMirror {
    store: Arc<dyn DurableStore>,
    write_lock: Arc<Mutex<()>>,
}

impl LocalMirror {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Load the collection. Missing, unreadable or corrupt payloads load as
    /// empty; the failure is logged and discarded.
    pub fn load(&self) -> Vec<Item> {
        let raw = match self.store.get(ITEMS_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(error = %e, "failed to read local mirror");
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "discarding corrupt local mirror payload");
                Vec::new()
            }
        }
    }

    /// Overwrite the whole collection.
    pub fn save(&self, items: &[Item]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(items)?;
        self.store.set(ITEMS_KEY, &raw)
    }

    pub fn get(&self, id: &str) -> Option<Item> {
        self.load().into_iter().find(|item| item.id == id)
    }

    /// Insert at the head of the collection.
    pub fn append(&self, item: Item) -> Result<(), StoreError> {
        self.modify(|items| {
            items.retain(|existing| existing.id != item.id);
            items.insert(0, item);
        })
    }

    /// Remove by id. Returns whether a record was removed.
    pub fn remove(&self, id: &str) -> Result<bool, StoreError> {
        self.modify(|items| {
            let before = items.len();
            items.retain(|item| item.id != id);
            items.len() != before
        })
    }

    /// Apply an update in place. Returns the record as it was before.
    pub fn patch(&self, id: &str, input: &UpdateItemInput) -> Result<Option<Item>, StoreError> {
        self.modify(|items| {
            let item = items.iter_mut().find(|item| item.id == id)?;
            let previous = item.clone();
            item.apply(input);
            Some(previous)
        })
    }

    /// Replace the record with the same id in place, or insert at the head.
    pub fn upsert(&self, item: Item) -> Result<(), StoreError> {
        self.modify(|items| match items.iter_mut().find(|existing| existing.id == item.id) {
            Some(slot) => *slot = item,
            None => items.insert(0, item),
        })
    }

    /// Swap the record `old_id` for `item`, keeping its position.
    pub fn replace(&self, old_id: &str, item: Item) -> Result<(), StoreError> {
        self.modify(|items| {
            items.retain(|existing| existing.id != item.id || existing.id == old_id);
            match items.iter_mut().find(|existing| existing.id == old_id) {
                Some(slot) => *slot = item,
                None => items.insert(0, item),
            }
        })
    }

    /// Make the mirror match a complete server listing.
    ///
    /// Records with provisional ids are unknown to the server and are kept at
    /// the head; every other record is replaced by `server`.
    pub fn reconcile(&self, server: &[Item]) -> Result<(), StoreError> {
        self.modify(|items| {
            items.retain(Item::is_provisional);
            items.extend(server.iter().cloned());
        })?;
        debug!(count = server.len(), "reconciled local mirror with server");
        Ok(())
    }

    /// Derive a page from the mirror: substring filter, then slice.
    pub fn query(&self, desc: &QueryDescriptor) -> PaginatedResult {
        paginate(&self.load(), desc)
    }

    fn modify<T>(&self, f: impl FnOnce(&mut Vec<Item>) -> T) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut items = self.load();
        let out = f(&mut items);
        self.save(&items)?;
        Ok(out)
    }
}

// ============================================================================
// Tests
// ============================================================================
