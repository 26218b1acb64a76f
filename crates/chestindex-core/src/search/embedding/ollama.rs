//! Local embedding model served by Ollama

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{http_client, truncate_input, EmbeddingService};
use crate::error::{ChestError, ChestResult};
use crate::search::config::EmbeddingConfig;
use crate::search::types::EmbeddingTask;

const DEFAULT_API_BASE: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "nomic-embed-text";

/// Client for a model running on the local machine
pub struct OllamaEmbedder {
    client: Client,
    api_base: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> ChestResult<Self> {
        Ok(Self::with_client(config, http_client(config)?))
    }

    pub fn with_client(config: &EmbeddingConfig, client: Client) -> Self {
        let api_base = config
            .api_base
            .clone()
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let model = config
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            model,
        }
    }

    /// nomic-embed models are trained with task prefixes
    fn prepare(&self, text: &str, task: EmbeddingTask) -> String {
        let text = truncate_input(text);
        if !self.model.starts_with("nomic-embed") {
            return text;
        }
        match task {
            EmbeddingTask::Document => format!("search_document: {}", text),
            EmbeddingTask::Query => format!("search_query: {}", text),
        }
    }
}

#[async_trait]
impl EmbeddingService for OllamaEmbedder {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn embed(&self, text: &str, task: EmbeddingTask) -> ChestResult<Vec<f32>> {
        let url = format!("{}/api/embed", self.api_base);
        let request = EmbedRequest {
            model: &self.model,
            input: vec![self.prepare(text, task)],
        };

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ErrorResponse>(&body) {
                return Err(ChestError::Embedding(error.error));
            }
            return Err(ChestError::Embedding(format!(
                "Ollama error ({}): {}",
                status, body
            )));
        }

        let response: EmbedResponse = serde_json::from_str(&body)?;
        response
            .embeddings
            .into_iter()
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ChestError::Embedding("No embedding returned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_prefixes() {
        let embedder = OllamaEmbedder::with_client(&EmbeddingConfig::default(), Client::new());
        assert_eq!(embedder.api_base, DEFAULT_API_BASE);
        assert_eq!(embedder.model, DEFAULT_MODEL);
        assert_eq!(
            embedder.prepare("diamond sword", EmbeddingTask::Query),
            "search_query: diamond sword"
        );
        assert_eq!(
            embedder.prepare("diamond sword", EmbeddingTask::Document),
            "search_document: diamond sword"
        );
    }

    #[test]
    fn test_other_models_have_no_prefix() {
        let config = EmbeddingConfig {
            model: Some("mxbai-embed-large".to_string()),
            api_base: Some("http://gpu-box:11434/".to_string()),
            ..Default::default()
        };
        let embedder = OllamaEmbedder::with_client(&config, Client::new());
        assert_eq!(embedder.api_base, "http://gpu-box:11434");
        assert_eq!(embedder.prepare("stone", EmbeddingTask::Query), "stone");
    }

    #[tokio::test]
    async fn test_unreachable_server_rejects_call() {
        let config = EmbeddingConfig {
            api_base: Some("http://127.0.0.1:9".to_string()),
            timeout_secs: 2,
            ..Default::default()
        };
        let embedder = OllamaEmbedder::new(&config).unwrap();
        assert!(embedder.embed("stone", EmbeddingTask::Document).await.is_err());
    }
}
