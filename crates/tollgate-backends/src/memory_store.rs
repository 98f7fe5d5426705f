use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use tollgate_core::store::merge_partial;
use tollgate_core::{DocumentStore, Query, TollgateError, TollgateResult};

/// In-memory document store backed by a `HashMap` per collection.
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryDocumentStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, HashMap::len)
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> TollgateResult<Option<Value>> {
        let collections = self.collections.read();
        Ok(collections.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn set(&self, collection: &str, id: &str, doc: Value) -> TollgateResult<()> {
        let mut collections = self.collections.write();
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, partial: Value) -> TollgateResult<()> {
        let mut collections = self.collections.write();
        let doc = collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| TollgateError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        merge_partial(doc, partial)
    }

    async fn query(&self, collection: &str, query: &Query) -> TollgateResult<Vec<Value>> {
        let collections = self.collections.read();
        let docs = collections
            .get(collection)
            .map(|c| c.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(query.apply(docs))
    }
}
