use std::sync::{
    PoisonError, RwLock,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use serde_json::Value;

use super::{Store, StoreError, Values};

/// A store backed by an in-process map.
///
/// Useful for embedding and for sharing one mapping between several
/// coordinators. `insert` and `delete` mutate the map directly, the way an
/// external writer would, without going through any coordinator.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<Values>,
    fetches: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `values`.
    pub fn with_values(values: Values) -> Self {
        Self {
            values: RwLock::new(values),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Sets a key behind the back of any coordinator.
    pub fn insert(&self, name: impl Into<String>, value: Value) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value);
    }

    /// Deletes a key behind the back of any coordinator.
    pub fn delete(&self, name: &str) -> Option<Value> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Number of times `fetch_all` has been called.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn fetch_all(&self) -> Result<Values, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        Ok(self
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn write(&self, name: &str, value: &Value) -> Result<(), StoreError> {
        self.insert(name, value.clone());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), StoreError> {
        self.delete(name);
        Ok(())
    }
}
