use crate::error::Result;
use crate::store::{Collection, Store};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Process-local store. Documents are lost when it is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<Collection, BTreeMap<String, serde_json::Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.collections
            .read()
            .get(&collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.collections.read().values().all(BTreeMap::is_empty)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert(
        &self,
        collection: Collection,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        self.collections
            .write()
            .entry(collection)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .collections
            .read()
            .get(&collection)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    async fn list(&self, collection: Collection) -> Result<Vec<serde_json::Value>> {
        Ok(self
            .collections
            .read()
            .get(&collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool> {
        Ok(self
            .collections
            .write()
            .get_mut(&collection)
            .and_then(|docs| docs.remove(key))
            .is_some())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
