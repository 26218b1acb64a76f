//! Text embedding providers
//!
//! Every provider implements [`EmbeddingService`]. [`create_embedding_service`]
//! picks one from configuration and falls back to the local Ollama provider when
//! the configuration cannot be used.

mod gemini;
mod ollama;
mod openai;

use std::sync::Arc;

use async_trait::async_trait;

use super::config::EmbeddingConfig;
use super::types::EmbeddingTask;
use crate::error::ChestResult;

pub use gemini::GeminiEmbedder;
pub use ollama::OllamaEmbedder;
pub use openai::OpenAiEmbedder;

/// Async text -> vector function
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Embed one text. A failure affects only this call.
    async fn embed(&self, text: &str, task: EmbeddingTask) -> ChestResult<Vec<f32>>;
}

/// Known providers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    Ollama,
    OpenAi,
    Gemini,
}

impl EmbeddingProvider {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "ollama" | "local" => Some(Self::Ollama),
            "openai" | "open_ai" | "openai-compatible" => Some(Self::OpenAi),
            "gemini" | "google" => Some(Self::Gemini),
            _ => None,
        }
    }
}

/// Build the configured provider. Never fails: an unknown provider name or a
/// remote provider without credentials falls back to the local provider.
pub fn create_embedding_service(config: &EmbeddingConfig) -> Arc<dyn EmbeddingService> {
    let provider = match EmbeddingProvider::parse(&config.provider) {
        Some(provider) => provider,
        None => {
            log::warn!(
                "[Embedding] Unknown provider '{}', using local ollama",
                config.provider
            );
            return local_fallback(config);
        }
    };

    let service: ChestResult<Arc<dyn EmbeddingService>> = match provider {
        EmbeddingProvider::Ollama => {
            OllamaEmbedder::new(config).map(|e| Arc::new(e) as Arc<dyn EmbeddingService>)
        }
        EmbeddingProvider::OpenAi => {
            OpenAiEmbedder::new(config).map(|e| Arc::new(e) as Arc<dyn EmbeddingService>)
        }
        EmbeddingProvider::Gemini => {
            GeminiEmbedder::new(config).map(|e| Arc::new(e) as Arc<dyn EmbeddingService>)
        }
    };

    match service {
        Ok(service) => {
            log::info!("[Embedding] Using {} provider", service.name());
            service
        }
        Err(e) => {
            log::warn!(
                "[Embedding] Cannot use '{}' provider ({}), using local ollama",
                config.provider,
                e
            );
            local_fallback(config)
        }
    }
}

fn local_fallback(config: &EmbeddingConfig) -> Arc<dyn EmbeddingService> {
    // Settings meant for another provider do not apply to the local one.
    let local = EmbeddingConfig {
        provider: "ollama".to_string(),
        timeout_secs: config.timeout_secs,
        ..Default::default()
    };
    Arc::new(OllamaEmbedder::with_client(
        &local,
        reqwest::Client::new(),
    ))
}

/// Build the HTTP client every provider uses
pub(crate) fn http_client(config: &EmbeddingConfig) -> ChestResult<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(config.timeout()).build()?)
}

/// Most embedding APIs reject inputs beyond ~8K tokens. Characters are a cheap
/// upper bound: ~4 chars per token for English.
pub(crate) const MAX_INPUT_CHARS: usize = 8000;

pub(crate) fn truncate_input(text: &str) -> String {
    if text.chars().count() > MAX_INPUT_CHARS {
        text.chars().take(MAX_INPUT_CHARS).collect()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parsing() {
        assert_eq!(EmbeddingProvider::parse("OpenAI"), Some(EmbeddingProvider::OpenAi));
        assert_eq!(EmbeddingProvider::parse(" gemini "), Some(EmbeddingProvider::Gemini));
        assert_eq!(EmbeddingProvider::parse("local"), Some(EmbeddingProvider::Ollama));
        assert_eq!(EmbeddingProvider::parse("word2vec"), None);
    }

    #[test]
    fn test_unknown_provider_falls_back_to_local() {
        let config = EmbeddingConfig {
            provider: "word2vec".to_string(),
            ..Default::default()
        };
        assert_eq!(create_embedding_service(&config).name(), "ollama");
    }

    #[test]
    fn test_missing_key_falls_back_to_local() {
        let config = EmbeddingConfig {
            provider: "gemini".to_string(),
            api_key: Some(String::new()),
            ..Default::default()
        };
        if std::env::var("GEMINI_API_KEY").is_err() && std::env::var("GOOGLE_API_KEY").is_err() {
            assert_eq!(create_embedding_service(&config).name(), "ollama");
        }
    }

    #[test]
    fn test_configured_remote_provider() {
        let config = EmbeddingConfig {
            provider: "openai".to_string(),
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        assert_eq!(create_embedding_service(&config).name(), "openai");
    }

    #[test]
    fn test_truncate_input_respects_char_boundaries() {
        let long = "é".repeat(MAX_INPUT_CHARS + 10);
        let truncated = truncate_input(&long);
        assert_eq!(truncated.chars().count(), MAX_INPUT_CHARS);
        assert_eq!(truncate_input("short"), "short");
    }
}
