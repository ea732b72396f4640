//! Ollama language model over its REST API.
//!
//! Embeddings come from `/api/embeddings` on the embedder endpoint, answers
//! from `/api/generate` on the model endpoint with streaming disabled.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::ModelConfig;
use crate::core::flatten::embedding_text;
use crate::domain::Payload;

use super::{AdapterError, LanguageModel};

const SERVICE: &str = "ollama";

pub struct OllamaModel {
    client: reqwest::Client,
    url: String,
    model_name: String,
    embedder_url: String,
    embedder_model_name: String,
    base_prompt: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaModel {
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build HTTP client for Ollama")?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model_name: config.model_name.clone(),
            embedder_url: config.embedder_url().trim_end_matches('/').to_string(),
            embedder_model_name: config.embedder_model_name.clone(),
            base_prompt: config.base_prompt.clone(),
        })
    }

    /// Fill the prompt template with the rendered context documents
    pub fn render_prompt(&self, question: &str, context: &[Payload]) -> String {
        let context = context
            .iter()
            .map(embedding_text)
            .collect::<Vec<_>>()
            .join("\n");

        self.base_prompt
            .replace("{context}", &context)
            .replace("{question}", question)
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        url: String,
        body: serde_json::Value,
    ) -> Result<T, AdapterError> {
        let response = self.client.post(&url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body,
            });
        }

        response.json::<T>().await.map_err(|e| AdapterError::Response {
            service: SERVICE,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AdapterError> {
        let response: EmbeddingResponse = self
            .post(
                format!("{}/api/embeddings", self.embedder_url),
                json!({ "model": self.embedder_model_name, "prompt": text }),
            )
            .await?;

        if response.embedding.is_empty() {
            return Err(AdapterError::EmptyEmbedding);
        }
        debug!(dimensions = response.embedding.len(), "Generated embedding");
        Ok(response.embedding)
    }

    async fn answer(&self, question: &str, context: &[Payload]) -> Result<String, AdapterError> {
        let prompt = self.render_prompt(question, context);
        let response: GenerateResponse = self
            .post(
                format!("{}/api/generate", self.url),
                json!({ "model": self.model_name, "prompt": prompt, "stream": false }),
            )
            .await?;

        Ok(response.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelKind;

    #[test]
    fn test_render_prompt() {
        let config = ModelConfig {
            kind: ModelKind::Ollama,
            url: "http://ollama:11434/".to_string(),
            base_prompt: "Q: {question}\nC: {context}".to_string(),
            ..Default::default()
        };
        let model = OllamaModel::from_config(&config).unwrap();
        assert_eq!(model.url, "http://ollama:11434");
        assert_eq!(model.embedder_url, "http://ollama:11434");

        let doc = serde_json::json!({ "machine": { "field": "north" } });
        let context = vec![doc.as_object().cloned().unwrap()];
        assert_eq!(
            model.render_prompt("where?", &context),
            "Q: where?\nC: {\"machine.field\":\"north\"}"
        );
    }
}
