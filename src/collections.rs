//! Op Collection Manager (§4.3): maps a logical collection to its op log
//! collection and ensures the two required indexes exist, once per process.

use std::collections::HashSet;

use bson::doc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::AdapterResult;
use crate::model::CollectionName;
use crate::store::Store;

#[derive(Default)]
pub struct OpCollectionManager {
    indexed: RwLock<HashSet<String>>,
}

impl OpCollectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the op collection name for `collection`, creating its indexes
    /// first if this is the first use of `collection` seen by this manager.
    pub async fn ensure_indexes<S: Store>(
        &self,
        store: &S,
        collection: &CollectionName,
        disable_index_creation: bool,
    ) -> AdapterResult<String> {
        let op_collection = collection.op_collection_name();

        if disable_index_creation {
            return Ok(op_collection);
        }

        if self.indexed.read().await.contains(&op_collection) {
            return Ok(op_collection);
        }

        let mut indexed = self.indexed.write().await;
        if indexed.contains(&op_collection) {
            return Ok(op_collection);
        }

        debug!(op_collection = %op_collection, "creating op log indexes");
        store
            .create_index(&op_collection, doc! { "d": 1, "v": 1 }, true)
            .await?;
        store
            .create_index(&op_collection, doc! { "src": 1, "seq": 1, "v": 1 }, true)
            .await?;

        indexed.insert(op_collection.clone());
        Ok(op_collection)
    }
}
