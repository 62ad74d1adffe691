//! File-based storage backend: one JSON object on disk

use crate::{PreferenceStore, StorageError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Preference store persisted as a JSON document
pub struct FileStore {
    path: PathBuf,
    /// In-memory copy of the document, written through on every set
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the preferences file at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let entries = if path.exists() {
            let loaded = Self::load(&path)?;
            info!("Loaded {} preference(s) from {:?}", loaded.len(), path);
            loaded
        } else {
            debug!("Preferences file {:?} not found, starting empty", path);
            BTreeMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<BTreeMap<String, String>, StorageError> {
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            StorageError::Corruption(format!("Invalid preferences file {:?}: {}", path, e))
        })
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Write to a sibling temp file and rename so a crash never leaves half a document
        let tmp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(entries)?;
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }
}

#[async_trait]
impl PreferenceStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        let mut updated = entries.clone();
        updated.insert(key.to_string(), value.to_string());
        self.save(&updated)?;
        *entries = updated;
        debug!("Preference key={} written to {:?}", key, self.path);
        Ok(())
    }
}
