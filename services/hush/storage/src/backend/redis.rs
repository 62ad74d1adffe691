//! Redis storage backend

use crate::{PreferenceStore, StorageError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

/// Preference store backed by a Redis server
pub struct RedisStore {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    /// Connect to Redis at `url`; every key is stored as `key_prefix + key`
    pub async fn connect(url: &str, key_prefix: String) -> Result<Self, StorageError> {
        let client = redis::Client::open(url).map_err(backend_error)?;
        let manager = ConnectionManager::new(client).await.map_err(backend_error)?;
        info!("Connected to Redis preference store at {}", url);

        Ok(Self {
            manager,
            key_prefix,
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl PreferenceStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.manager.clone();
        conn.get(self.full_key(key)).await.map_err(backend_error)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let full_key = self.full_key(key);
        debug!("Redis preference set key={}", full_key);
        let mut conn = self.manager.clone();
        conn.set::<_, _, ()>(full_key, value)
            .await
            .map_err(backend_error)
    }
}

fn backend_error(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}
