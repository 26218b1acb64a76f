//! Google Gemini embedding API client

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{http_client, truncate_input, EmbeddingService};
use crate::error::{ChestError, ChestResult};
use crate::search::config::EmbeddingConfig;
use crate::search::types::EmbeddingTask;

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "text-embedding-004";

/// Gemini `embedContent` client. Gemini embeddings are asymmetric, so the
/// task type is forwarded as `RETRIEVAL_DOCUMENT` / `RETRIEVAL_QUERY`.
pub struct GeminiEmbedder {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    dimensions: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedContentRequest {
    model: String,
    content: Content,
    task_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct EmbedContentResponse {
    embedding: ContentEmbedding,
}

#[derive(Debug, Deserialize)]
struct ContentEmbedding {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

fn task_type(task: EmbeddingTask) -> &'static str {
    match task {
        EmbeddingTask::Document => "RETRIEVAL_DOCUMENT",
        EmbeddingTask::Query => "RETRIEVAL_QUERY",
    }
}

impl GeminiEmbedder {
    /// Create a new client. Fails without an API key.
    pub fn new(config: &EmbeddingConfig) -> ChestResult<Self> {
        let api_key = config.get_api_key("gemini", &["GEMINI_API_KEY", "GOOGLE_API_KEY"])?;
        let model = config
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Ok(Self {
            client: http_client(config)?,
            api_key,
            api_base: config
                .api_base
                .clone()
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: model.trim_start_matches("models/").to_string(),
            dimensions: (config.dimensions > 0).then_some(config.dimensions),
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:embedContent?key={}",
            self.api_base,
            urlencoding::encode(&self.model),
            urlencoding::encode(&self.api_key)
        )
    }

    fn request(&self, text: &str, task: EmbeddingTask) -> EmbedContentRequest {
        EmbedContentRequest {
            model: format!("models/{}", self.model),
            content: Content {
                parts: vec![Part {
                    text: truncate_input(text),
                }],
            },
            task_type: task_type(task),
            output_dimensionality: self.dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingService for GeminiEmbedder {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn embed(&self, text: &str, task: EmbeddingTask) -> ChestResult<Vec<f32>> {
        let response = self
            .client
            .post(self.endpoint())
            .json(&self.request(text, task))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ErrorResponse>(&body) {
                return Err(ChestError::Embedding(error.error.message));
            }
            return Err(ChestError::Embedding(format!(
                "Gemini error ({}): {}",
                status, body
            )));
        }

        let response: EmbedContentResponse = serde_json::from_str(&body)?;
        if response.embedding.values.is_empty() {
            return Err(ChestError::Embedding("No embedding returned".to_string()));
        }
        Ok(response.embedding.values)
    }
}
