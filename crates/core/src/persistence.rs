use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("stored value under `{key}` could not be decoded: {message}")]
    Decode { key: String, message: String },
    #[error("value for `{key}` could not be encoded: {message}")]
    Encode { key: String, message: String },
}

/// Key/value contract the control plane persists through.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Cheap reachability check for health reporting.
    async fn ping(&self) -> Result<(), StoreError> {
        self.get("__ping__").await.map(|_| ())
    }
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|error| StoreError::Decode { key: key.to_string(), message: error.to_string() })
}

pub async fn set_json<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)
        .map_err(|error| StoreError::Encode { key: key.to_string(), message: error.to_string() })?;
    store.set(key, &raw).await
}

#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
