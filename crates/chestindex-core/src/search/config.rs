//! Index configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChestError, ChestResult};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChestIndexConfig {
    /// Embedding provider configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Vector storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Indexer scheduling configuration
    #[serde(default)]
    pub indexer: IndexerConfig,

    /// Search behavior configuration
    #[serde(default)]
    pub search: SearchBehaviorConfig,
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// "ollama" (local), "openai" or "gemini"
    #[serde(default = "default_provider")]
    pub provider: String,

    /// API key for remote providers
    #[serde(default)]
    pub api_key: Option<String>,

    /// API base URL; provider default when unset
    #[serde(default)]
    pub api_base: Option<String>,

    /// Model name; provider default when unset
    #[serde(default)]
    pub model: Option<String>,

    /// Requested embedding dimensions (0 = provider default)
    #[serde(default)]
    pub dimensions: usize,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            api_base: None,
            model: None,
            dimensions: 0,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    /// Get API key from config or the given environment variables
    pub fn get_api_key(&self, provider: &'static str, env_vars: &[&str]) -> ChestResult<String> {
        if let Some(ref key) = self.api_key {
            if !key.is_empty() {
                return Ok(key.clone());
            }
        }

        env_vars
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
            .ok_or(ChestError::ApiKeyMissing(provider))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

/// Vector storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "sqlite" (embedded), "qdrant" (remote) or "lancedb" (embedded, feature-gated)
    #[serde(default = "default_backend")]
    pub backend: String,

    /// SQLite database path
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,

    /// LanceDB directory
    #[serde(default)]
    pub lancedb_path: Option<PathBuf>,

    /// Qdrant base URL
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,

    #[serde(default)]
    pub qdrant_api_key: Option<String>,

    /// Collection / table name
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite_path: None,
            lancedb_path: None,
            qdrant_url: default_qdrant_url(),
            qdrant_api_key: None,
            collection: default_collection(),
        }
    }
}

impl StorageConfig {
    /// Get SQLite path, using default if not specified
    pub fn get_sqlite_path(&self) -> PathBuf {
        self.sqlite_path
            .clone()
            .unwrap_or_else(|| ChestIndexConfig::config_dir().join("containers.db"))
    }

    /// Get LanceDB path, using default if not specified
    pub fn get_lancedb_path(&self) -> PathBuf {
        self.lancedb_path
            .clone()
            .unwrap_or_else(|| ChestIndexConfig::config_dir().join("lancedb"))
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}

fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}

fn default_collection() -> String {
    "container_chunks".to_string()
}

/// Indexer scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Quiet period before a changed container is re-indexed
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Worker threads of the indexing runtime (at least 2)
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// How long shutdown waits for in-flight indexing
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Maximum characters of embedding text per chunk
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            worker_threads: default_worker_threads(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_chunk_chars: default_max_chunk_chars(),
        }
    }
}

impl IndexerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads.max(MIN_WORKER_THREADS)
    }
}

/// Smallest worker pool the indexer runs with
pub const MIN_WORKER_THREADS: usize = 2;

fn default_debounce_ms() -> u64 {
    1000
}

fn default_worker_threads() -> usize {
    MIN_WORKER_THREADS
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_max_chunk_chars() -> usize {
    2000
}

/// Search behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchBehaviorConfig {
    /// Default result limit
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Weight of the BM25 keyword boost; 0 ranks purely by similarity
    #[serde(default)]
    pub keyword_boost_weight: f32,

    /// Candidates fetched per requested result before re-ranking
    #[serde(default = "default_oversample")]
    pub oversample: usize,
}

impl Default for SearchBehaviorConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            keyword_boost_weight: 0.0,
            oversample: default_oversample(),
        }
    }
}

fn default_limit() -> usize {
    10
}

fn default_oversample() -> usize {
    2
}

impl ChestIndexConfig {
    /// Load configuration from the config dir and environment.
    /// Priority: environment variables > config.toml > defaults.
    /// A broken config file is ignored.
    pub fn load() -> ChestResult<Self> {
        let path = Self::config_path();
        let mut config = if path.exists() {
            match Self::load_from(&path) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("[Config] Ignoring {}: {}", path.display(), e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Load an explicit config file, without environment overrides
    pub fn load_from(path: &Path) -> ChestResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ChestResult<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env(&mut self) {
        if let Ok(provider) = std::env::var("EMBEDDING_PROVIDER") {
            self.embedding.provider = provider;
        }
        if let Ok(api_key) = std::env::var("EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(api_key);
        }
        if let Ok(api_base) = std::env::var("EMBEDDING_API_BASE") {
            self.embedding.api_base = Some(api_base);
        }
        if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
            self.embedding.model = Some(model);
        }
        if let Ok(backend) = std::env::var("CHESTINDEX_STORAGE") {
            self.storage.backend = backend;
        }
        if let Ok(url) = std::env::var("QDRANT_URL") {
            self.storage.qdrant_url = url;
        }
        if let Ok(key) = std::env::var("QDRANT_API_KEY") {
            self.storage.qdrant_api_key = Some(key);
        }
    }

    /// Validate values that have no safe fallback
    pub fn validate(&self) -> ChestResult<()> {
        if !self.search.keyword_boost_weight.is_finite() || self.search.keyword_boost_weight < 0.0 {
            return Err(ChestError::Config(format!(
                "keyword_boost_weight must be a non-negative number, got {}",
                self.search.keyword_boost_weight
            )));
        }
        if self.indexer.max_chunk_chars == 0 {
            return Err(ChestError::Config(
                "max_chunk_chars must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Get base config directory
    pub fn config_dir() -> PathBuf {
        if let Ok(root) = std::env::var("CHESTINDEX_ROOT") {
            return PathBuf::from(root);
        }

        dirs::home_dir()
            .map(|h| h.join(".chestindex"))
            .unwrap_or_else(|| PathBuf::from(".chestindex"))
    }

    /// Get config file path (config.toml)
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}
