//! OpenAI-compatible embedding API client

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{http_client, truncate_input, EmbeddingService};
use crate::error::{ChestError, ChestResult};
use crate::search::config::EmbeddingConfig;
use crate::search::types::EmbeddingTask;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "text-embedding-3-small";

/// OpenAI embedding API client. Also works against compatible servers
/// (DashScope, vLLM, LM Studio) through `api_base`.
pub struct OpenAiEmbedder {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    requested_dimensions: usize,
    /// Actual dimensions detected from API response (0 = not yet detected)
    actual_dimensions: AtomicUsize,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<String>,
    /// Only sent for models that support it (e.g. text-embedding-3-*)
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

impl OpenAiEmbedder {
    /// Create a new embedding client. Fails without an API key.
    pub fn new(config: &EmbeddingConfig) -> ChestResult<Self> {
        let api_key = config.get_api_key("openai", &["OPENAI_API_KEY", "OPENAI_KEY"])?;
        let api_base = config
            .api_base
            .clone()
            .filter(|b| !b.is_empty())
            .or_else(|| std::env::var("OPENAI_API_BASE").ok())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        Ok(Self {
            client: http_client(config)?,
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
            model: config
                .model
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            requested_dimensions: config.dimensions,
            actual_dimensions: AtomicUsize::new(0),
        })
    }

    /// Actual dimensions detected from API (0 if not yet detected)
    pub fn actual_dimensions(&self) -> usize {
        self.actual_dimensions.load(Ordering::Relaxed)
    }

    /// Generate embeddings for several texts in one request
    pub async fn embed_batch(&self, texts: Vec<String>) -> ChestResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let input_count = texts.len();
        let texts: Vec<String> = texts.iter().map(|t| truncate_input(t)).collect();

        // Only send dimensions for OpenAI text-embedding-3 models
        // Other APIs (like DashScope) may not support this parameter
        let dimensions = if self.model.starts_with("text-embedding-3") && self.requested_dimensions > 0 {
            Some(self.requested_dimensions)
        } else {
            None
        };

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            // Try to parse error message
            if let Ok(error_response) = serde_json::from_str::<ErrorResponse>(&body) {
                return Err(ChestError::Embedding(error_response.error.message));
            }
            return Err(ChestError::Embedding(format!(
                "API error ({}): {}",
                status, body
            )));
        }

        let response: EmbeddingResponse = serde_json::from_str(&body)?;

        // Verify we got embeddings for all inputs
        if response.data.len() != input_count {
            return Err(ChestError::Embedding(format!(
                "Embedding count mismatch: sent {} texts, got {} embeddings",
                input_count,
                response.data.len()
            )));
        }

        // Sort by index to ensure correct order
        let mut data = response.data;
        data.sort_by_key(|d| d.index);

        if let Some(first) = data.first() {
            self.record_dimensions(first.embedding.len());
        }

        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    fn record_dimensions(&self, detected: usize) {
        let current = self.actual_dimensions.load(Ordering::Relaxed);
        if current == 0 {
            self.actual_dimensions.store(detected, Ordering::Relaxed);
            log::info!("[Embedding] Auto-detected embedding dimensions: {}", detected);
        } else if current != detected {
            log::warn!(
                "[Embedding] Embedding dimension mismatch: expected {}, got {}",
                current,
                detected
            );
        }
    }
}

#[async_trait]
impl EmbeddingService for OpenAiEmbedder {
    fn name(&self) -> &str {
        "openai"
    }

    /// The OpenAI models are symmetric, so the task is not sent.
    async fn embed(&self, text: &str, _task: EmbeddingTask) -> ChestResult<Vec<f32>> {
        self.embed_batch(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ChestError::Embedding("No embedding returned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EmbeddingConfig {
            api_key: Some("sk-test".to_string()),
            api_base: Some("https://example.invalid/v1/".to_string()),
            ..Default::default()
        };
        let embedder = OpenAiEmbedder::new(&config).unwrap();
        assert_eq!(embedder.model, DEFAULT_MODEL);
        assert_eq!(embedder.api_base, "https://example.invalid/v1");
        assert_eq!(embedder.actual_dimensions(), 0);
    }

    #[test]
    fn test_dimension_detection_keeps_first_value() {
        let config = EmbeddingConfig {
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        let embedder = OpenAiEmbedder::new(&config).unwrap();
        embedder.record_dimensions(1536);
        embedder.record_dimensions(1024);
        assert_eq!(embedder.actual_dimensions(), 1536);
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        let config = EmbeddingConfig {
            api_key: Some("sk-test".to_string()),
            api_base: Some("http://127.0.0.1:9".to_string()),
            ..Default::default()
        };
        let embedder = OpenAiEmbedder::new(&config).unwrap();
        assert!(embedder.embed_batch(vec![]).await.unwrap().is_empty());
    }
}
