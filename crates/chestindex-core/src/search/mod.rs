//! Container search module
//!
//! Semantic search over indexed containers.
//!
//! ## Features
//!
//! - Debounced background indexing keyed by container location
//! - Local (Ollama) or remote (OpenAI, Gemini) embeddings
//! - Embedded SQLite, remote Qdrant or LanceDB vector storage
//! - Hybrid search (vector + BM25 keyword boost)
//! - Event-driven index synchronization
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chestindex_core::search::{create_embedding_service, create_vector_storage, Searcher};
//!
//! let embedding = create_embedding_service(&config.embedding);
//! let storage = create_vector_storage(&config.storage).await?;
//! let searcher = Searcher::new(embedding, storage, &config.search);
//! let hits = searcher.search("enchanted pickaxe", 10).await?;
//! ```

mod chunks;
mod config;
mod embedding;
mod index_sync;
mod indexer;
mod scorer;
mod searcher;
mod storage;
mod types;

#[cfg(test)]
mod testing;

pub use chunks::{ChunkBuilder, PendingChunk};
pub use config::{
    ChestIndexConfig, EmbeddingConfig, IndexerConfig, SearchBehaviorConfig, StorageConfig,
};
pub use embedding::{
    create_embedding_service, EmbeddingProvider, EmbeddingService, GeminiEmbedder,
    OllamaEmbedder, OpenAiEmbedder,
};
pub use index_sync::EventSyncService;
pub use indexer::ContainerIndexer;
pub use scorer::HybridScorer;
pub use searcher::{expand_query, Searcher};
#[cfg(feature = "lancedb")]
pub use storage::LanceVectorStorage;
pub use storage::{
    cosine_similarity, create_vector_storage, QdrantVectorStorage, SqliteVectorStorage,
    StorageBackend, VectorStorage,
};
pub use types::*;
