//! Vector storage backends
//!
//! - [`SqliteVectorStorage`]: embedded single-file store (default)
//! - [`QdrantVectorStorage`]: remote Qdrant server over REST
//! - `LanceVectorStorage`: embedded LanceDB directory (feature `lancedb`)

#[cfg(feature = "lancedb")]
mod lance;
mod qdrant;
mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::config::StorageConfig;
use super::types::{ContainerChunk, SearchFilter, SearchHit};
use crate::container::{ContainerLocations, LocationData};
use crate::error::ChestResult;

#[cfg(feature = "lancedb")]
pub use lance::LanceVectorStorage;
pub use qdrant::QdrantVectorStorage;
pub use sqlite::SqliteVectorStorage;

/// Async CRUD and similarity search over container chunks, keyed by primary location
#[async_trait]
pub trait VectorStorage: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Record that every position in `locations` belongs to its primary.
    /// Idempotent; replaces any earlier mapping for the same primary.
    async fn register_container_positions(&self, locations: &ContainerLocations) -> ChestResult<()>;

    /// Upsert chunks. A chunk replaces the one at the same (location, chunk_index);
    /// chunks of the same location with a higher index than any in `chunks` are removed.
    async fn index_chunks(&self, chunks: &[ContainerChunk]) -> ChestResult<()>;

    /// Remove every chunk and position mapping of a container
    async fn delete(&self, location: &LocationData) -> ChestResult<()>;

    /// Up to `limit` nearest chunks with scores in [0, 1]
    async fn search(
        &self,
        query_vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
    ) -> ChestResult<Vec<SearchHit>>;

    /// Primary location a block position belongs to, if the container is known
    async fn resolve_primary(&self, location: &LocationData) -> ChestResult<Option<LocationData>>;

    /// Total stored chunks
    async fn count(&self) -> ChestResult<usize>;
}

/// Known backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Sqlite,
    Qdrant,
    LanceDb,
}

impl StorageBackend {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "sqlite" | "file" | "embedded" => Some(Self::Sqlite),
            "qdrant" | "remote" => Some(Self::Qdrant),
            "lancedb" | "lance" => Some(Self::LanceDb),
            _ => None,
        }
    }
}

/// Open the configured backend. Unknown or unavailable backend names fall back
/// to the embedded SQLite store.
pub async fn create_vector_storage(config: &StorageConfig) -> ChestResult<Arc<dyn VectorStorage>> {
    let backend = StorageBackend::parse(&config.backend).unwrap_or_else(|| {
        log::warn!(
            "[Storage] Unknown backend '{}', using sqlite",
            config.backend
        );
        StorageBackend::Sqlite
    });

    let storage: Arc<dyn VectorStorage> = match backend {
        StorageBackend::Sqlite => Arc::new(SqliteVectorStorage::open(&config.get_sqlite_path())?),
        StorageBackend::Qdrant => Arc::new(QdrantVectorStorage::new(config)?),
        #[cfg(feature = "lancedb")]
        StorageBackend::LanceDb => {
            Arc::new(LanceVectorStorage::open(config.get_lancedb_path(), &config.collection).await?)
        }
        #[cfg(not(feature = "lancedb"))]
        StorageBackend::LanceDb => {
            log::warn!("[Storage] Built without the lancedb feature, using sqlite");
            Arc::new(SqliteVectorStorage::open(&config.get_sqlite_path())?)
        }
    };

    log::info!("[Storage] Using {} backend", storage.name());
    Ok(storage)
}

/// Cosine similarity; 0 for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Map cosine similarity to a [0, 1] score. Anti-correlated vectors score 0.
pub(crate) fn similarity_score(cosine: f32) -> f32 {
    if cosine.is_nan() {
        0.0
    } else {
        cosine.clamp(0.0, 1.0)
    }
}

/// Highest chunk index per location, in location order
pub(crate) fn max_index_by_location(chunks: &[ContainerChunk]) -> BTreeMap<LocationData, u32> {
    let mut max_index = BTreeMap::new();
    for chunk in chunks {
        max_index
            .entry(chunk.location.clone())
            .and_modify(|idx: &mut u32| *idx = (*idx).max(chunk.chunk_index))
            .or_insert(chunk.chunk_index);
    }
    max_index
}

/// Sort hits by score, best first, and keep `limit`
pub(crate) fn rank_hits(mut hits: Vec<SearchHit>, limit: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(limit);
    hits
}
