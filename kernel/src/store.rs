//! Key/value persistence contract used to back mesh bases.
//!
//! Backends live outside the kernel; `MemoryStore` is the reference
//! implementation used by tests and single-process nodes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Key already exists: {0}")]
    KeyExists(String),

    #[error("Key does not exist: {0}")]
    KeyDoesNotExist(String),

    #[error("Storage error: {0}")]
    Backend(String),
}

/// One persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreValue {
    pub key: String,
    pub encoding_id: String,
    pub time_created: i64,
    pub time_updated: i64,
    pub time_read: i64,
    pub time_expires: Option<i64>,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Fails with `KeyExists` if the key is present.
    async fn put(&self, value: StoreValue) -> StoreResult<()>;

    /// Fails with `KeyDoesNotExist` if the key is absent.
    async fn update(&self, value: StoreValue) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<StoreValue>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Returns `true` if an existing value was updated.
    async fn put_or_update(&self, value: StoreValue) -> StoreResult<bool> {
        match self.update(value.clone()).await {
            Ok(()) => Ok(true),
            Err(StoreError::KeyDoesNotExist(_)) => self.put(value).await.map(|_| false),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, StoreValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, value: StoreValue) -> StoreResult<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(&value.key) {
            return Err(StoreError::KeyExists(value.key));
        }
        entries.insert(value.key.clone(), value);
        Ok(())
    }

    async fn update(&self, value: StoreValue) -> StoreResult<()> {
        let mut entries = self.entries.write();
        match entries.get_mut(&value.key) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(StoreError::KeyDoesNotExist(value.key)),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<StoreValue> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyDoesNotExist(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::KeyDoesNotExist(key.to_string()))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
