//! Persisted key/value state.
//!
//! The session keeps its restart state (device map, connection parameters,
//! last-known gateway identity) in an opaque key/value store.

use crate::{Error, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Key holding the serialized authoritative device map
pub const DEVICES_KEY: &str = "devices";
pub const HOST_KEY: &str = "ip_address";
pub const PORT_KEY: &str = "port";
pub const ACCESS_TOKEN_KEY: &str = "access_token";

pub trait StateStore: Send {
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn set(&mut self, key: &str, value: Value) -> Result<()>;

    /// Write several keys at once.
    ///
    /// # Errors
    ///
    /// Returns the first write error.
    fn set_many(&mut self, entries: Map<String, Value>) -> Result<()> {
        for (key, value) in entries {
            self.set(&key, value)?;
        }
        Ok(())
    }
}

/// JSON object on disk, rewritten whole on every write
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Map<String, Value>,
}

impl JsonFileStore {
    /// Open the store at `path`.
    ///
    /// A missing file starts empty; a corrupt file is logged and treated as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn open(path: &Path) -> Result<Self> {
        let mut store = Self {
            path: path.to_path_buf(),
            entries: Map::new(),
        };

        if !path.exists() {
            debug!("State file not found at {}", path.display());
            return Ok(store);
        }

        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(entries)) => {
                debug!("Loaded {} state keys from {}", entries.len(), path.display());
                store.entries = entries;
            }
            Ok(_) => warn!("State file {} is not a JSON object, ignoring", path.display()),
            Err(e) => warn!(
                "Failed to parse state file: {} (at line {}, column {})",
                e,
                e.line(),
                e.column()
            ),
        }

        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.entries)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

impl StateStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        self.flush()
    }

    fn set_many(&mut self, entries: Map<String, Value>) -> Result<()> {
        self.entries.extend(entries);
        self.flush()
    }
}

/// In-process store. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<Map<String, Value>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything stored so far
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if a writer panicked while holding the entries.
    pub fn snapshot(&self) -> Result<Map<String, Value>> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(entries.clone())
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| Error::Store(e.to_string()))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(&dir.path().join("state.json")).unwrap();
        assert_eq!(store.get(DEVICES_KEY).unwrap(), None);
    }

    #[test]
    fn test_file_store_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut store = JsonFileStore::open(&path).unwrap();
        store.set(HOST_KEY, json!("10.0.0.2")).unwrap();
        store.set(PORT_KEY, json!(8501)).unwrap();

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get(HOST_KEY).unwrap(), Some(json!("10.0.0.2")));
        assert_eq!(reopened.get(PORT_KEY).unwrap(), Some(json!(8501)));
    }

    #[test]
    fn test_file_store_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let mut store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get(DEVICES_KEY).unwrap(), None);

        store.set(DEVICES_KEY, json!({})).unwrap();
        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get(DEVICES_KEY).unwrap(), Some(json!({})));
    }

    #[test]
    fn test_file_store_set_many_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut store = JsonFileStore::open(&path).unwrap();
        let mut entries = Map::new();
        entries.insert("device_id".into(), json!("pad-1"));
        entries.insert("model".into(), json!("WP-100"));
        store.set_many(entries).unwrap();

        let content: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(content["device_id"], "pad-1");
        assert_eq!(content["model"], "WP-100");
    }

    #[test]
    fn test_memory_store_clones_share_entries() {
        let store = MemoryStore::new();
        let mut writer = store.clone();
        writer.set(ACCESS_TOKEN_KEY, json!("secret")).unwrap();

        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), Some(json!("secret")));
        assert_eq!(store.snapshot().unwrap().len(), 1);
    }
}
