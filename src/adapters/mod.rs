//! Adapter interfaces for external systems.
//!
//! Persistence and language-model backends sit behind the [`DocumentStore`]
//! and [`LanguageModel`] traits. One implementation per backend; the
//! factories below pick one from configuration at startup.

pub mod memory;
pub mod ollama;
pub mod qdrant;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use thiserror::Error;

use crate::config::{DatabaseConfig, ModelConfig, ModelKind, StoreKind};
use crate::domain::Payload;

pub use memory::MemoryStore;
pub use ollama::OllamaModel;
pub use qdrant::QdrantStore;

/// Errors raised at a collaborator boundary
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} returned {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("Unexpected response from {service}: {message}")]
    Response {
        service: &'static str,
        message: String,
    },

    #[error("Embedding is empty")]
    EmptyEmbedding,
}

/// Persistence contract
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Store one payload in a collection, creating the collection if needed
    async fn insert_document(
        &self,
        collection: &str,
        payload: &Payload,
    ) -> Result<(), AdapterError>;

    /// Up to `limit` documents relevant to `text`
    async fn query(
        &self,
        collection: &str,
        text: &str,
        limit: usize,
    ) -> Result<Vec<Payload>, AdapterError>;

    /// Drop a collection; missing collections are not an error
    async fn delete_collection(&self, collection: &str) -> Result<(), AdapterError>;
}

/// Embedding and question-answering contract
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Embedding vector for `text`
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AdapterError>;

    /// Answer `question` using `context` documents
    async fn answer(&self, question: &str, context: &[Payload]) -> Result<String, AdapterError>;
}

/// Build the configured language model; `None` when `model.type` is `none`
pub fn build_model(config: &ModelConfig) -> Result<Option<Arc<dyn LanguageModel>>> {
    match config.kind {
        ModelKind::None => Ok(None),
        ModelKind::Ollama => Ok(Some(Arc::new(OllamaModel::from_config(config)?))),
    }
}

/// Build the configured document store
pub fn build_store(
    config: &DatabaseConfig,
    model: Option<Arc<dyn LanguageModel>>,
) -> Result<Arc<dyn DocumentStore>> {
    match config.kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreKind::Qdrant => {
            let Some(model) = model else {
                bail!("database type 'qdrant' needs a model for embeddings (set model.type)");
            };
            Ok(Arc::new(QdrantStore::from_config(config, model)?))
        }
    }
}
