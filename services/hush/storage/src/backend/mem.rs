//! In-memory storage backend for development and testing

use crate::{PreferenceStore, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// In-memory preference store
#[derive(Clone, Default)]
pub struct MemoryStore {
    /// key -> value
    entries: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was stored yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PreferenceStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        debug!("Preference set key={} len={}", key, value.len());
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
