//! Qdrant document store over its REST API.
//!
//! Payloads are embedded from their flattened text and stored with the
//! original (nested) payload attached. Collections are created on first
//! insert, sized to the embedding.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::core::flatten::embedding_text;
use crate::domain::Payload;

use super::{AdapterError, DocumentStore, LanguageModel};

const SERVICE: &str = "qdrant";

pub struct QdrantStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: Arc<dyn LanguageModel>,
    /// Collections known to exist
    known: Mutex<HashSet<String>>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    #[serde(default)]
    payload: Option<Payload>,
}

impl QdrantStore {
    pub fn from_config(config: &DatabaseConfig, model: Arc<dyn LanguageModel>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client for Qdrant")?;

        Ok(Self {
            client,
            base_url: config.base_url(),
            api_key: config.api_key.clone(),
            model,
            known: Mutex::new(HashSet::new()),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, path));
        match self.api_key {
            Some(ref key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AdapterError::Status {
            service: SERVICE,
            status: status.as_u16(),
            body,
        })
    }

    async fn ensure_collection(&self, collection: &str, size: usize) -> Result<(), AdapterError> {
        let mut known = self.known.lock().await;
        if known.contains(collection) {
            return Ok(());
        }

        let response = self
            .request(Method::GET, &format!("collections/{}", collection))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            let created = self
                .request(Method::PUT, &format!("collections/{}", collection))
                .json(&json!({ "vectors": { "size": size, "distance": "Cosine" } }))
                .send()
                .await?;
            Self::check(created).await?;
            info!(collection, size, "Created Qdrant collection");
        } else {
            Self::check(response).await?;
        }

        known.insert(collection.to_string());
        Ok(())
    }
}

/// Upsert body for one point
pub fn upsert_body(id: Uuid, vector: &[f32], payload: &Payload) -> Value {
    json!({
        "points": [{
            "id": id.to_string(),
            "vector": vector,
            "payload": payload,
        }]
    })
}

#[async_trait]
impl DocumentStore for QdrantStore {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn insert_document(
        &self,
        collection: &str,
        payload: &Payload,
    ) -> Result<(), AdapterError> {
        let vector = self.model.embed(&embedding_text(payload)).await?;
        self.ensure_collection(collection, vector.len()).await?;

        let response = self
            .request(Method::PUT, &format!("collections/{}/points?wait=true", collection))
            .json(&upsert_body(Uuid::new_v4(), &vector, payload))
            .send()
            .await?;
        Self::check(response).await?;

        debug!(collection, "Inserted document");
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        text: &str,
        limit: usize,
    ) -> Result<Vec<Payload>, AdapterError> {
        let vector = self.model.embed(text).await?;

        let response = self
            .request(Method::POST, &format!("collections/{}/points/search", collection))
            .json(&json!({ "vector": vector, "limit": limit, "with_payload": true }))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        let search: SearchResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| AdapterError::Response {
                service: SERVICE,
                message: e.to_string(),
            })?;

        Ok(search.result.into_iter().filter_map(|p| p.payload).collect())
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), AdapterError> {
        self.known.lock().await.remove(collection);

        let response = self
            .request(Method::DELETE, &format!("collections/{}", collection))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;

        info!(collection, "Deleted Qdrant collection");
        Ok(())
    }
}
