use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use super::{Category, KeyStore};
use crate::error::StoreError;

type Tables = HashMap<Category, BTreeMap<String, Vec<u8>>>;

/// In-memory key store.
///
/// Records live in one `BTreeMap` per category behind an `RwLock`, so reads
/// run concurrently and writes are exclusive. Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all categories.
    pub fn len(&self) -> usize {
        self.read().values().map(BTreeMap::len).sum()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[allow(clippy::expect_used, reason = "poisoning means a writer panicked mid-update")]
    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().expect("key store lock poisoned")
    }

    #[allow(clippy::expect_used, reason = "poisoning means a writer panicked mid-update")]
    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().expect("key store lock poisoned")
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, category: Category, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read().get(&category).and_then(|t| t.get(key)).cloned())
    }

    fn put(&self, category: Category, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.write().entry(category).or_default().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, category: Category, key: &str) -> Result<bool, StoreError> {
        Ok(self.write().get_mut(&category).is_some_and(|t| t.remove(key).is_some()))
    }

    fn count(&self, category: Category) -> Result<usize, StoreError> {
        Ok(self.read().get(&category).map_or(0, BTreeMap::len))
    }

    fn max_numeric_key(&self, category: Category) -> Result<Option<u32>, StoreError> {
        Ok(self
            .read()
            .get(&category)
            .and_then(|t| t.keys().filter_map(|k| k.parse::<u32>().ok()).max()))
    }

    fn clear(&self, category: Category) -> Result<(), StoreError> {
        self.write().remove(&category);
        Ok(())
    }
}
