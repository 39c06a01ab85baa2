//! Key-value persistence seam for pipeline records.
//!
//! The runner writes project, document, and issue records through the
//! `RecordStore` trait and never depends on the representation. Keys are
//! namespaced (`project/…`, `document/…`, `issue/…`) so a prefix scan
//! lists everything belonging to one run. `MemoryStore` is the
//! in-process implementation used by the CLI and tests.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

/// Storage capability: JSON records addressed by namespaced string keys.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put(&self, key: &str, value: Value) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// All values whose key starts with `prefix`, in key order.
    async fn scan(&self, prefix: &str) -> Result<Vec<Value>>;

    /// Removes a key, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// In-memory store backed by an ordered map behind an async lock.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<Value>> {
        let entries = self.entries.read().await;
        // Keys sharing a prefix are contiguous in the ordered map.
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }
}
