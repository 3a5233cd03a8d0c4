//! JSON-file backed key-value store.
//!
//! The whole map is rewritten on every mutation: entries are a handful of
//! short strings per logical user, so simplicity beats incremental writes.
//! Writes go to a sibling temp file first and are renamed into place.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, info};

use super::KeyValueStore;
use crate::error::{AttestError, Result};

/// Key-value store persisted as a single JSON object.
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`, creating parent directories as needed.
    ///
    /// A missing file is an empty store; a corrupt file is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let entries: BTreeMap<String, String> =
                serde_json::from_str(&content).map_err(|e| {
                    AttestError::Store(format!("corrupt store {}: {}", path.display(), e))
                })?;
            info!(path = %path.display(), entries = entries.len(), "Loaded attestation store");
            entries
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            info!(path = %path.display(), "Creating new attestation store");
            BTreeMap::new()
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let body = serde_json::to_string_pretty(entries)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, &self.path)?;
        debug!(path = %self.path.display(), "Persisted attestation store");
        Ok(())
    }

    fn lock_poisoned() -> AttestError {
        AttestError::Store("store lock poisoned".into())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| Self::lock_poisoned())?;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| Self::lock_poisoned())?;
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }
}
