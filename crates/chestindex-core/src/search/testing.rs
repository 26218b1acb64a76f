//! In-memory doubles for the embedding and storage seams

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::embedding::EmbeddingService;
use super::storage::{cosine_similarity, rank_hits, similarity_score, VectorStorage};
use super::types::{ContainerChunk, EmbeddingTask, SearchFilter, SearchHit};
use crate::container::{ContainerLocations, LocationData};
use crate::error::{ChestError, ChestResult};

const KEYWORD_DIMENSIONS: usize = 64;

/// Bag-of-words embedder: texts sharing words get similar vectors
pub struct KeywordEmbedder;

impl KeywordEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; KEYWORD_DIMENSIONS];
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            vector[fnv1a(word) % KEYWORD_DIMENSIONS] += 1.0;
        }
        vector
    }
}

fn fnv1a(word: &str) -> usize {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in word.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash as usize
}

#[async_trait]
impl EmbeddingService for KeywordEmbedder {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn embed(&self, text: &str, _task: EmbeddingTask) -> ChestResult<Vec<f32>> {
        Ok(Self::vector(text))
    }
}

/// KeywordEmbedder that takes a while to answer
pub struct SlowEmbedder {
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl SlowEmbedder {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingService for SlowEmbedder {
    fn name(&self) -> &str {
        "slow"
    }

    async fn embed(&self, text: &str, _task: EmbeddingTask) -> ChestResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(KeywordEmbedder::vector(text))
    }
}

pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingService for FailingEmbedder {
    fn name(&self) -> &str {
        "failing"
    }

    async fn embed(&self, _text: &str, _task: EmbeddingTask) -> ChestResult<Vec<f32>> {
        Err(ChestError::Embedding("provider unavailable".to_string()))
    }
}

/// In-memory storage that records every call
#[derive(Default)]
pub struct RecordingStorage {
    chunks: Mutex<BTreeMap<(LocationData, u32), ContainerChunk>>,
    positions: Mutex<HashMap<LocationData, LocationData>>,
    last_write: Mutex<Vec<ContainerChunk>>,
    deleted: Mutex<Vec<LocationData>>,
    writes: AtomicUsize,
    registrations: AtomicUsize,
    searches: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later call fails
    pub fn failing() -> Self {
        let storage = Self::default();
        storage.fail.store(true, Ordering::SeqCst);
        storage
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deleted.lock().len()
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    pub fn last_write(&self) -> Vec<ContainerChunk> {
        self.last_write.lock().clone()
    }

    pub fn deleted(&self) -> Vec<LocationData> {
        self.deleted.lock().clone()
    }

    pub fn stored_chunks(&self) -> usize {
        self.chunks.lock().len()
    }

    fn check(&self) -> ChestResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChestError::Storage("storage unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStorage for RecordingStorage {
    fn name(&self) -> &str {
        "recording"
    }

    async fn register_container_positions(&self, locations: &ContainerLocations) -> ChestResult<()> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let mut positions = self.positions.lock();
        for location in locations.all_locations() {
            positions.insert(location.clone(), locations.primary_location().clone());
        }
        Ok(())
    }

    async fn index_chunks(&self, chunks: &[ContainerChunk]) -> ChestResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let mut stored = self.chunks.lock();
        for chunk in chunks {
            stored.retain(|(location, idx), _| location != &chunk.location || *idx <= max_index(chunks, &chunk.location));
            stored.insert((chunk.location.clone(), chunk.chunk_index), chunk.clone());
        }
        *self.last_write.lock() = chunks.to_vec();
        Ok(())
    }

    async fn delete(&self, location: &LocationData) -> ChestResult<()> {
        self.deleted.lock().push(location.clone());
        self.check()?;
        self.chunks.lock().retain(|(l, _), _| l != location);
        self.positions
            .lock()
            .retain(|position, primary| position != location && primary != location);
        Ok(())
    }

    async fn search(
        &self,
        query_vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
    ) -> ChestResult<Vec<SearchHit>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let hits = self
            .chunks
            .lock()
            .values()
            .filter(|c| filter.matches(&c.location))
            .map(|c| {
                let score = similarity_score(cosine_similarity(query_vector, &c.vector));
                SearchHit::new(c.location.clone(), score, c.text.clone())
                    .with_content(c.content.clone())
                    .with_chunk_index(c.chunk_index)
            })
            .collect();
        let mut hits = rank_hits(hits, limit);
        let positions = self.positions.lock();
        for hit in &mut hits {
            let blocks = positions
                .iter()
                .filter(|(_, primary)| **primary == hit.location)
                .map(|(position, _)| position.clone());
            hit.all_locations.extend(blocks);
        }
        Ok(hits)
    }

    async fn resolve_primary(&self, location: &LocationData) -> ChestResult<Option<LocationData>> {
        self.check()?;
        if let Some(primary) = self.positions.lock().get(location) {
            return Ok(Some(primary.clone()));
        }
        let indexed = self.chunks.lock().keys().any(|(l, _)| l == location);
        Ok(indexed.then(|| location.clone()))
    }

    async fn count(&self) -> ChestResult<usize> {
        self.check()?;
        Ok(self.chunks.lock().len())
    }
}

fn max_index(chunks: &[ContainerChunk], location: &LocationData) -> u32 {
    chunks
        .iter()
        .filter(|c| &c.location == location)
        .map(|c| c.chunk_index)
        .max()
        .unwrap_or(0)
}
