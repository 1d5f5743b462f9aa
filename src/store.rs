//! Cross-run persisted key-value store.
//!
//! Serialized as a JSON array of `[key, value]` pairs inside the project
//! state directory and reconstructed into a map at startup. Written back to
//! disk exactly once per process lifetime, on exit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::Result;
use crate::manifest::PROJECT_STATE_DIR;

/// Store file name inside the project state directory.
pub const CROSS_RUN_FILE: &str = "CROSS_RUN.json";

/// Reserved key holding the virtual file system record.
pub const VFS_KEY: &str = "INTERNAL/VIRTUAL_FILE_SYSTEM";

/// Key refreshed on every process start.
pub const LAST_UPDATE_KEY: &str = "lastUpdate";

/// Project-scoped store surviving across runs.
pub struct CrossRunStore {
    path: PathBuf,
    data: Mutex<BTreeMap<String, Value>>,
    saved: AtomicBool,
}

impl CrossRunStore {
    /// Load the store for a project, creating the state directory if needed.
    ///
    /// `lastUpdate` is refreshed on every load.
    pub fn load(project_root: &Path) -> Result<Self> {
        let dir = project_root.join(PROJECT_STATE_DIR);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(CROSS_RUN_FILE);

        let mut data: BTreeMap<String, Value> = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let pairs: Vec<(String, Value)> = serde_json::from_str(&content)?;
            pairs.into_iter().collect()
        } else {
            BTreeMap::new()
        };

        data.insert(
            LAST_UPDATE_KEY.to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );

        Ok(Self {
            path,
            data: Mutex::new(data),
            saved: AtomicBool::new(false),
        })
    }

    /// On-disk location of the store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    /// Check whether a key is present.
    pub fn has(&self, key: &str) -> bool {
        self.data.lock().contains_key(key)
    }

    /// Set a value.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.data.lock().insert(key.into(), value);
    }

    /// Remove a value, returning it.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.data.lock().remove(key)
    }

    /// Write the store to disk, at most once per process lifetime.
    ///
    /// Returns `false` when an earlier exit path already saved. The flag
    /// keeps the exit handler re-entrant: normal exit, the interrupt hook,
    /// and the panic hook may all race to call this.
    pub fn save_on_exit(&self) -> Result<bool> {
        if self.saved.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let pairs: Vec<(String, Value)> = self
            .data
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let content = serde_json::to_string_pretty(&pairs)?;
        std::fs::write(&self.path, content)?;
        Ok(true)
    }
}

impl std::fmt::Debug for CrossRunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossRunStore")
            .field("path", &self.path)
            .field("keys", &self.data.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fresh_store_has_last_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = CrossRunStore::load(dir.path()).unwrap();
        assert!(store.has(LAST_UPDATE_KEY));
        assert!(!store.has(VFS_KEY));
    }

    #[test]
    fn test_roundtrip_pairs() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CrossRunStore::load(dir.path()).unwrap();
            store.set(VFS_KEY, json!({ "src/a.mcs": { "out/a.json": "h1" } }));
            assert!(store.save_on_exit().unwrap());
        }

        let store = CrossRunStore::load(dir.path()).unwrap();
        let vfs = store.get(VFS_KEY).unwrap();
        assert_eq!(vfs["src/a.mcs"]["out/a.json"], "h1");
    }

    #[test]
    fn test_save_runs_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = CrossRunStore::load(dir.path()).unwrap();
        store.set("k", json!(1));
        assert!(store.save_on_exit().unwrap());

        // A later mutation is not flushed by a second call.
        store.set("k", json!(2));
        assert!(!store.save_on_exit().unwrap());

        let reloaded = CrossRunStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.get("k"), Some(json!(1)));
    }

    #[test]
    fn test_stored_file_is_pair_array() {
        let dir = tempfile::tempdir().unwrap();
        let store = CrossRunStore::load(dir.path()).unwrap();
        store.set("k", json!("v"));
        store.save_on_exit().unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        let parsed: Vec<(String, Value)> = serde_json::from_str(&content).unwrap();
        assert!(parsed.iter().any(|(k, _)| k == "k"));
        assert!(parsed.iter().any(|(k, _)| k == LAST_UPDATE_KEY));
    }
}
