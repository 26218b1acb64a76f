//! Query embedding, storage search and hybrid re-ranking

use std::collections::HashSet;
use std::sync::Arc;

use super::config::SearchBehaviorConfig;
use super::embedding::EmbeddingService;
use super::scorer::HybridScorer;
use super::storage::VectorStorage;
use super::types::{EmbeddingTask, SearchFilter, SearchHit};
use crate::error::ChestResult;

/// Searches indexed containers by meaning
pub struct Searcher {
    embedding: Arc<dyn EmbeddingService>,
    storage: Arc<dyn VectorStorage>,
    scorer: HybridScorer,
    oversample: usize,
    default_limit: usize,
}

impl Searcher {
    pub fn new(
        embedding: Arc<dyn EmbeddingService>,
        storage: Arc<dyn VectorStorage>,
        config: &SearchBehaviorConfig,
    ) -> Self {
        Self {
            embedding,
            storage,
            scorer: HybridScorer::new(config.keyword_boost_weight),
            oversample: config.oversample.max(1),
            default_limit: config.default_limit,
        }
    }


    pub fn scorer(&self) -> &HybridScorer {
        &self.scorer
    }

    /// Search all worlds
    pub async fn search(&self, query: &str, limit: usize) -> ChestResult<Vec<SearchHit>> {
        self.search_with_filter(query, limit, &SearchFilter::default())
            .await
    }

    /// Search all worlds with the configured default limit
    pub async fn search_default(&self, query: &str) -> ChestResult<Vec<SearchHit>> {
        self.search(query, self.default_limit).await
    }

    pub async fn search_with_filter(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> ChestResult<Vec<SearchHit>> {
        let expanded = expand_query(query);
        if expanded.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let query_vector = self.embedding.embed(&expanded, EmbeddingTask::Query).await?;

        // Fetch more candidates than needed so re-ranking has room to reorder
        let fetch_limit = limit.saturating_mul(self.oversample);
        let candidates = self
            .storage
            .search(&query_vector, fetch_limit, filter)
            .await?;
        log::debug!(
            "[Search] '{}' matched {} candidates",
            expanded,
            candidates.len()
        );

        let ranked = self.scorer.rerank(candidates, &expanded);

        // A container split into several chunks is reported once, at its best chunk
        let mut seen = HashSet::new();
        let mut results: Vec<SearchHit> = ranked
            .into_iter()
            .filter(|hit| seen.insert(hit.location.clone()))
            .collect();
        results.truncate(limit);
        Ok(results)
    }
}

/// Normalized query text used for both embedding and keyword scoring
pub fn expand_query(query: &str) -> String {
    query.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::LocationData;
    use crate::search::testing::{FailingEmbedder, KeywordEmbedder, RecordingStorage};
    use crate::search::types::ContainerChunk;

    fn chunk(x: i32, chunk_index: u32, text: &str) -> ContainerChunk {
        ContainerChunk {
            location: LocationData::new("overworld", x, 64, 0).unwrap(),
            chunk_index,
            text: text.to_string(),
            content: format!("[\"{}\"]", text),
            vector: KeywordEmbedder::vector(text),
            indexed_at: 0,
        }
    }

    async fn searcher_with(chunks: &[ContainerChunk]) -> (Searcher, Arc<RecordingStorage>) {
        let storage = Arc::new(RecordingStorage::new());
        storage.index_chunks(chunks).await.unwrap();
        let searcher = Searcher::new(
            Arc::new(KeywordEmbedder),
            storage.clone(),
            &SearchBehaviorConfig::default(),
        );
        (searcher, storage)
    }

    #[test]
    fn test_expand_query() {
        assert_eq!(expand_query("  Diamond SWORD "), "diamond sword");
    }

    #[tokio::test]
    async fn test_empty_query_returns_nothing() {
        let (searcher, storage) = searcher_with(&[chunk(0, 0, "stone")]).await;
        assert!(searcher.search("   ", 10).await.unwrap().is_empty());
        assert!(searcher.search("stone", 0).await.unwrap().is_empty());
        assert_eq!(storage.search_count(), 0);
    }

    #[tokio::test]
    async fn test_results_are_deduplicated_by_container() {
        let (searcher, _) = searcher_with(&[
            chunk(0, 0, "diamond sword #weapon"),
            chunk(0, 1, "diamond pickaxe #tool"),
            chunk(1, 0, "bread #food"),
        ])
        .await;

        let results = searcher.search("diamond", 10).await.unwrap();
        let locations: Vec<i32> = results.iter().map(|h| h.location.x).collect();
        assert_eq!(locations.iter().filter(|&&x| x == 0).count(), 1);
        assert_eq!(results[0].location.x, 0);
    }

    #[tokio::test]
    async fn test_limit_is_respected() {
        let chunks: Vec<_> = (0..5).map(|x| chunk(x, 0, "cobblestone")).collect();
        let (searcher, _) = searcher_with(&chunks).await;
        assert_eq!(searcher.search("cobblestone", 3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_default_limit_applies() {
        let chunks: Vec<_> = (0..12).map(|x| chunk(x, 0, "cobblestone")).collect();
        let (searcher, _) = searcher_with(&chunks).await;
        let expected = SearchBehaviorConfig::default().default_limit;
        assert_eq!(searcher.search_default("cobblestone").await.unwrap().len(), expected);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_returned() {
        let storage = Arc::new(RecordingStorage::new());
        let searcher = Searcher::new(
            Arc::new(FailingEmbedder),
            storage,
            &SearchBehaviorConfig::default(),
        );
        assert!(searcher.search("stone", 5).await.is_err());
    }
}
