//! In-process document store.
//!
//! Nothing survives a restart. Queries match terms against the flattened
//! payload text instead of embeddings, so no model is needed.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::flatten::embedding_text;
use crate::domain::Payload;

use super::{AdapterError, DocumentStore};

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Payload>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every document in a collection, oldest first
    pub async fn documents(&self, collection: &str) -> Vec<Payload> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Collection names, sorted
    pub async fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert_document(
        &self,
        collection: &str,
        payload: &Payload,
    ) -> Result<(), AdapterError> {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(payload.clone());
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        text: &str,
        limit: usize,
    ) -> Result<Vec<Payload>, AdapterError> {
        let terms: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();
        let collections = self.collections.read().await;
        let Some(documents) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        Ok(documents
            .iter()
            .rev()
            .filter(|doc| {
                let haystack = embedding_text(doc).to_lowercase();
                terms.iter().all(|term| haystack.contains(term.as_str()))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), AdapterError> {
        self.collections.write().await.remove(collection);
        Ok(())
    }
}
