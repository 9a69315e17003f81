//! In-memory backend.
//!
//! Used by tests and as the fallback when the on-disk database cannot be
//! opened. Writes can be made to fail on demand.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{KeyValueBackend, Namespace, StoreError, StoreKey};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<StoreKey, Vec<u8>>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put`/`delete`/`clear` fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn check_writable(&self, key: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteRejected(key.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn put(&self, key: &StoreKey, value: Vec<u8>) -> Result<(), StoreError> {
        self.check_writable(&key.to_string())?;
        self.entries.write().await.insert(key.clone(), value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        self.check_writable(&key.to_string())?;
        self.entries.write().await.remove(key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn entries(&self, namespace: Namespace) -> Result<Vec<(StoreKey, Vec<u8>)>, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.check_writable("*")?;
        self.entries.write().await.clear();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
