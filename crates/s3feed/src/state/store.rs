//! Key/value persistence behind the state registry.
//!
//! Keys are independent: there are no multi-key transactions. Values are
//! JSON documents.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::StoreError;

pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Visits every entry in key order until `visit` returns `false`.
    fn each(&self, visit: &mut dyn FnMut(&str, &Value) -> bool) -> Result<(), StoreError>;

    /// Writes buffered changes to durable storage. May block.
    fn persist(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Volatile store, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }

    fn each(&self, visit: &mut dyn FnMut(&str, &Value) -> bool) -> Result<(), StoreError> {
        let snapshot = self.lock().clone();
        for (key, value) in &snapshot {
            if !visit(key, value) {
                break;
            }
        }
        Ok(())
    }
}

/// Store kept in one JSON document on disk.
///
/// Mutations only change the working copy. [`persist`](StateStore::persist)
/// writes the whole document to a sibling temp file and renames it over the
/// original, so a crash leaves either the old or the new version. A failed
/// write keeps the copy dirty and the next `persist` writes it again.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    working: Mutex<WorkingCopy>,
    /// Generation last written to disk. Held for the whole write so writers
    /// never interleave.
    written: Mutex<u64>,
}

#[derive(Debug, Default)]
struct WorkingCopy {
    entries: BTreeMap<String, Value>,
    generation: u64,
}

impl FileStore {
    /// Opens the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => {
                let doc: Map<String, Value> = serde_json::from_slice(&bytes)?;
                doc.into_iter().collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), entries = entries.len(), "opened state file");
        Ok(Self {
            path,
            working: Mutex::new(WorkingCopy {
                entries,
                generation: 0,
            }),
            written: Mutex::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the working copy has changes not yet on disk.
    pub fn is_dirty(&self) -> bool {
        let generation = self.lock().generation;
        generation != *self.lock_written()
    }

    fn lock(&self) -> MutexGuard<'_, WorkingCopy> {
        self.working.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_written(&self) -> MutexGuard<'_, u64> {
        self.written.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to replace state file");
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

impl StateStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.lock().entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut working = self.lock();
        working.entries.insert(key.to_string(), value);
        working.generation += 1;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut working = self.lock();
        if working.entries.remove(key).is_some() {
            working.generation += 1;
        }
        Ok(())
    }

    fn each(&self, visit: &mut dyn FnMut(&str, &Value) -> bool) -> Result<(), StoreError> {
        let snapshot = self.lock().entries.clone();
        for (key, value) in &snapshot {
            if !visit(key, value) {
                break;
            }
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), StoreError> {
        let mut written = self.lock_written();
        let (generation, bytes) = {
            let working = self.lock();
            if working.generation == *written {
                return Ok(());
            }
            (working.generation, serde_json::to_vec(&working.entries)?)
        };

        self.write(&bytes)?;
        *written = generation;
        debug!(path = %self.path.display(), generation, "state file written");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("registry.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.set("a", json!({"stored": true})).unwrap();
            store.set("b", json!("tail")).unwrap();
            store.remove("a").unwrap();
            assert!(!path.exists());
            store.persist().unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("b").unwrap(), Some(json!("tail")));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_failed_write_is_retried_by_next_persist() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("state");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let path = blocker.join("registry.json");

        let store = FileStore::open(&path).unwrap();
        store.set("a", json!(1)).unwrap();
        assert!(store.persist().is_err());
        assert!(store.is_dirty());
        assert_eq!(store.get("a").unwrap(), Some(json!(1)));

        std::fs::remove_file(&blocker).unwrap();
        store.persist().unwrap();
        assert!(!store.is_dirty());
        assert_eq!(FileStore::open(&path).unwrap().get("a").unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_persist_without_changes_does_not_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        let store = FileStore::open(&path).unwrap();
        store.persist().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            FileStore::open(&path),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_each_stops_when_visitor_declines() {
        let store = MemoryStore::new();
        for key in ["a", "b", "c"] {
            store.set(key, json!(key)).unwrap();
        }
        let mut seen = Vec::new();
        store
            .each(&mut |key, _| {
                seen.push(key.to_string());
                seen.len() < 2
            })
            .unwrap();
        assert_eq!(seen, vec!["a", "b"]);
    }
}
