/// Durable key-value storage used by the sync queue
///
/// The queue, the processed-key ledger and the idempotency counter all persist
/// through this trait, so a test double or a different backend can be swapped in
/// without touching the sync logic.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::Result;

/// A durable key-value store.
///
/// Implementations must only return `Ok` from `put` and `delete` once the change
/// would survive a process crash.
pub trait DurableStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Write a value, replacing any previous one
    fn put(&self, key: &str, value: Bytes) -> Result<()>;

    /// Remove a value. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Return every entry whose key starts with `prefix`, ordered by key
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>>;
}

impl<S: DurableStore + ?Sized> DurableStore for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: Bytes) -> Result<()> {
        (**self).put(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        (**self).scan_prefix(prefix)
    }
}

/// In-memory store for tests and ephemeral sessions
///
/// Clones share the same underlying map, which lets a test "restart" a queue
/// by opening a second one over the same store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.inner.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.inner.write().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        let inner = self.inner.read();
        Ok(inner
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
