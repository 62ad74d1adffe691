//! Preference storage for hush: a small key-value store with pluggable backends.
//!
//! The session reads the operator's display name once at startup and writes
//! it back after every successful handshake. Backends are in-memory (tests,
//! ephemeral runs), a JSON file on disk, and Redis behind the
//! `redis-backend` feature.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Key under which the operator's display name is stored
pub const USER_NAME_KEY: &str = "userName";

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Stored data could not be read back
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Invalid operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Backend-specific error
    #[error("Backend error: {0}")]
    Backend(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Asynchronous key-value access to durable preferences
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Read a value, `None` when the key was never written
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// Preference backend configuration
#[derive(Clone, Debug, Default)]
pub enum StorageMode {
    /// In-memory storage (dev/tests only)
    #[default]
    InMemory,
    /// JSON document on disk
    File {
        /// Path of the preferences file
        path: PathBuf,
    },
    /// Redis server
    Redis {
        /// Redis connection URL
        url: String,
        /// Prefix prepended to every key
        key_prefix: String,
    },
}

// Re-export backend implementations
pub use backend::file::FileStore;
pub use backend::mem::MemoryStore;
#[cfg(feature = "redis-backend")]
pub use backend::redis::RedisStore;

/// Create a preference store from configuration
pub async fn open_store(mode: StorageMode) -> Result<Arc<dyn PreferenceStore>, StorageError> {
    match mode {
        StorageMode::InMemory => Ok(Arc::new(MemoryStore::new())),
        StorageMode::File { path } => Ok(Arc::new(FileStore::open(path).await?)),
        #[cfg(feature = "redis-backend")]
        StorageMode::Redis { url, key_prefix } => {
            Ok(Arc::new(RedisStore::connect(&url, key_prefix).await?))
        }
        #[cfg(not(feature = "redis-backend"))]
        StorageMode::Redis { .. } => Err(StorageError::Invalid(
            "Redis preferences require the redis-backend feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_store() {
        let store = open_store(StorageMode::InMemory).await.unwrap();
        assert_eq!(store.get(USER_NAME_KEY).await.unwrap(), None);

        store.set(USER_NAME_KEY, "Mario").await.unwrap();
        assert_eq!(
            store.get(USER_NAME_KEY).await.unwrap().as_deref(),
            Some("Mario")
        );
    }

    #[cfg(not(feature = "redis-backend"))]
    #[tokio::test]
    async fn test_redis_mode_requires_feature() {
        let result = open_store(StorageMode::Redis {
            url: "redis://127.0.0.1/".to_string(),
            key_prefix: "hush:".to_string(),
        })
        .await;
        assert!(matches!(result, Err(StorageError::Invalid(_))));
    }
}
