//! Remote vector store on a Qdrant server, spoken to over its REST API
//!
//! Chunks live in `<collection>`, one point per (location, chunk_index).
//! Position mappings live in `<collection>_positions` with a one-dimensional
//! placeholder vector, since Qdrant points always carry one.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::{max_index_by_location, rank_hits, VectorStorage};
use crate::container::{ContainerLocations, LocationData};
use crate::error::{ChestError, ChestResult};
use crate::search::config::StorageConfig;
use crate::search::types::{ContainerChunk, SearchFilter, SearchHit};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on blocks per container when reading position mappings
const MAX_POSITIONS: usize = 64;

/// How a 404 answer is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnMissing {
    /// Reads and deletes: a missing collection holds nothing
    Empty,
    /// Upserts and collection creation: the data would be lost
    Fail,
}

pub struct QdrantVectorStorage {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    collection: String,
    positions_collection: String,
    chunks_ready: OnceCell<()>,
    positions_ready: OnceCell<()>,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    score: f32,
    #[serde(default)]
    payload: Option<ChunkPayload>,
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    world: String,
    x: i32,
    y: i32,
    z: i32,
    chunk_index: u32,
    text: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PositionPayload {
    x: i32,
    y: i32,
    z: i32,
    primary_x: i32,
    primary_y: i32,
    primary_z: i32,
}

#[derive(Debug, Deserialize)]
struct RecordPoint {
    #[serde(default)]
    payload: Option<PositionPayload>,
}

#[derive(Debug, Deserialize)]
struct ScrollResult {
    points: Vec<RecordPoint>,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: usize,
}

impl QdrantVectorStorage {
    pub fn new(config: &StorageConfig) -> ChestResult<Self> {
        let collection = if config.collection.trim().is_empty() {
            "container_chunks".to_string()
        } else {
            config.collection.trim().to_string()
        };
        Ok(Self {
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            base_url: config.qdrant_url.trim_end_matches('/').to_string(),
            api_key: config.qdrant_api_key.clone().filter(|k| !k.is_empty()),
            positions_collection: format!("{}_positions", collection),
            collection,
            chunks_ready: OnceCell::new(),
            positions_ready: OnceCell::new(),
        })
    }

    /// Send a request. A 404 answer is `Ok(None)` under [`OnMissing::Empty`]
    /// and a storage error under [`OnMissing::Fail`].
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        on_missing: OnMissing,
    ) -> ChestResult<Option<Value>> {
        let mut request = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(ref key) = self.api_key {
            request = request.header("api-key", key);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND && on_missing == OnMissing::Empty {
            return Ok(None);
        }
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ChestError::Storage(format!(
                "Qdrant error ({}) on {}: {}",
                status, path, text
            )));
        }
        let value: Value = serde_json::from_str(&text)?;
        Ok(Some(value.get("result").cloned().unwrap_or(Value::Null)))
    }

    async fn ensure_collection(&self, name: &str, dimensions: usize, distance: &str) -> ChestResult<()> {
        let path = format!("/collections/{}", name);
        if self
            .request(Method::GET, &path, None, OnMissing::Empty)
            .await?
            .is_some()
        {
            return Ok(());
        }
        log::info!(
            "[Storage] Creating qdrant collection '{}' ({} dims)",
            name,
            dimensions
        );
        self.request(
            Method::PUT,
            &path,
            Some(json!({ "vectors": { "size": dimensions, "distance": distance } })),
            OnMissing::Fail,
        )
        .await?;
        Ok(())
    }

    async fn ensure_chunks(&self, dimensions: usize) -> ChestResult<()> {
        self.chunks_ready
            .get_or_try_init(|| self.ensure_collection(&self.collection, dimensions, "Cosine"))
            .await
            .map(|_| ())
    }

    async fn ensure_positions(&self) -> ChestResult<()> {
        self.positions_ready
            .get_or_try_init(|| self.ensure_collection(&self.positions_collection, 1, "Dot"))
            .await
            .map(|_| ())
    }

    async fn delete_where(&self, collection: &str, filter: Value) -> ChestResult<()> {
        self.request(
            Method::POST,
            &format!("/collections/{}/points/delete?wait=true", collection),
            Some(json!({ "filter": filter })),
            OnMissing::Empty,
        )
        .await?;
        Ok(())
    }

    async fn positions_of(&self, primary: &LocationData) -> ChestResult<Vec<LocationData>> {
        let result = self
            .request(
                Method::POST,
                &format!("/collections/{}/points/scroll", self.positions_collection),
                Some(json!({
                    "filter": primary_filter(primary),
                    "limit": MAX_POSITIONS,
                    "with_payload": true,
                    "with_vector": false,
                })),
                OnMissing::Empty,
            )
            .await?;
        let Some(result) = result else {
            return Ok(vec![]);
        };
        let scroll: ScrollResult = serde_json::from_value(result)?;
        scroll
            .points
            .into_iter()
            .filter_map(|p| p.payload)
            .map(|p| LocationData::new(primary.world(), p.x, p.y, p.z))
            .collect()
    }

    async fn count_at(&self, location: &LocationData) -> ChestResult<usize> {
        let result = self
            .request(
                Method::POST,
                &format!("/collections/{}/points/count", self.collection),
                Some(json!({ "filter": location_filter(location), "exact": true })),
                OnMissing::Empty,
            )
            .await?;
        match result {
            Some(value) => Ok(serde_json::from_value::<CountResult>(value)?.count),
            None => Ok(0),
        }
    }
}

fn match_field(key: &str, value: Value) -> Value {
    json!({ "key": key, "match": { "value": value } })
}

fn location_filter(location: &LocationData) -> Value {
    json!({ "must": [
        match_field("world", json!(location.world())),
        match_field("x", json!(location.x)),
        match_field("y", json!(location.y)),
        match_field("z", json!(location.z)),
    ]})
}

fn primary_filter(primary: &LocationData) -> Value {
    json!({ "must": [
        match_field("world", json!(primary.world())),
        match_field("primary_x", json!(primary.x)),
        match_field("primary_y", json!(primary.y)),
        match_field("primary_z", json!(primary.z)),
    ]})
}

/// Server-side prefilter. The radius becomes a bounding box; the exact
/// sphere test runs on the returned hits.
fn search_filter(filter: &SearchFilter) -> Option<Value> {
    let mut must = Vec::new();
    if let Some(ref world) = filter.world {
        must.push(match_field("world", json!(world)));
    }
    if let Some((ref center, radius)) = filter.near {
        let r = i64::from(radius);
        for (key, value) in [("x", center.x), ("y", center.y), ("z", center.z)] {
            let value = i64::from(value);
            must.push(json!({ "key": key, "range": { "gte": value - r, "lte": value + r } }));
        }
    }
    (!must.is_empty()).then(|| json!({ "must": must }))
}

fn chunk_point_id(location: &LocationData, chunk_index: u32) -> String {
    let key = format!("{}#{}", location, chunk_index);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

fn position_point_id(location: &LocationData) -> String {
    let key = format!("position:{}", location);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

#[async_trait]
impl VectorStorage for QdrantVectorStorage {
    fn name(&self) -> &str {
        "qdrant"
    }

    async fn register_container_positions(&self, locations: &ContainerLocations) -> ChestResult<()> {
        self.ensure_positions().await?;
        let primary = locations.primary_location();
        self.delete_where(&self.positions_collection, primary_filter(primary))
            .await?;

        let points: Vec<Value> = locations
            .all_locations()
            .iter()
            .map(|location| {
                json!({
                    "id": position_point_id(location),
                    "vector": [1.0],
                    "payload": {
                        "world": location.world(),
                        "x": location.x,
                        "y": location.y,
                        "z": location.z,
                        "primary_x": primary.x,
                        "primary_y": primary.y,
                        "primary_z": primary.z,
                    }
                })
            })
            .collect();
        self.request(
            Method::PUT,
            &format!("/collections/{}/points?wait=true", self.positions_collection),
            Some(json!({ "points": points })),
            OnMissing::Fail,
        )
        .await?;
        Ok(())
    }

    async fn index_chunks(&self, chunks: &[ContainerChunk]) -> ChestResult<()> {
        let Some(first) = chunks.first() else {
            return Ok(());
        };
        if first.vector.is_empty() {
            return Err(ChestError::Storage("chunk has no vector".to_string()));
        }
        self.ensure_chunks(first.vector.len()).await?;

        let points: Vec<Value> = chunks
            .iter()
            .map(|chunk| {
                json!({
                    "id": chunk_point_id(&chunk.location, chunk.chunk_index),
                    "vector": chunk.vector,
                    "payload": {
                        "world": chunk.location.world(),
                        "x": chunk.location.x,
                        "y": chunk.location.y,
                        "z": chunk.location.z,
                        "chunk_index": chunk.chunk_index,
                        "text": chunk.text,
                        "content": chunk.content,
                        "indexed_at": chunk.indexed_at,
                    }
                })
            })
            .collect();
        self.request(
            Method::PUT,
            &format!("/collections/{}/points?wait=true", self.collection),
            Some(json!({ "points": points })),
            OnMissing::Fail,
        )
        .await?;

        for (location, max_index) in max_index_by_location(chunks) {
            let mut filter = location_filter(&location);
            if let Some(must) = filter.get_mut("must").and_then(Value::as_array_mut) {
                must.push(json!({ "key": "chunk_index", "range": { "gt": max_index } }));
            }
            self.delete_where(&self.collection, filter).await?;
        }
        Ok(())
    }

    async fn delete(&self, location: &LocationData) -> ChestResult<()> {
        self.delete_where(&self.collection, location_filter(location))
            .await?;
        self.delete_where(&self.positions_collection, location_filter(location))
            .await?;
        self.delete_where(&self.positions_collection, primary_filter(location))
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        query_vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
    ) -> ChestResult<Vec<SearchHit>> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let mut body = json!({
            "vector": query_vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = search_filter(filter) {
            body["filter"] = filter;
        }

        let result = self
            .request(
                Method::POST,
                &format!("/collections/{}/points/search", self.collection),
                Some(body),
                OnMissing::Empty,
            )
            .await?;
        // Nothing indexed yet
        let Some(result) = result else {
            return Ok(vec![]);
        };

        let points: Vec<ScoredPoint> = serde_json::from_value(result)?;
        let mut hits = Vec::with_capacity(points.len());
        for point in points {
            let Some(payload) = point.payload else {
                continue;
            };
            let location = LocationData::new(payload.world, payload.x, payload.y, payload.z)?;
            if !filter.matches(&location) {
                continue;
            }
            let mut hit = SearchHit::new(location, point.score, payload.text)
                .with_chunk_index(payload.chunk_index);
            if let Some(content) = payload.content {
                hit = hit.with_content(content);
            }
            hits.push(hit);
        }

        let mut hits = rank_hits(hits, limit);
        for hit in &mut hits {
            let blocks = self.positions_of(&hit.location).await?;
            hit.all_locations.extend(blocks);
        }
        Ok(hits)
    }

    async fn resolve_primary(&self, location: &LocationData) -> ChestResult<Option<LocationData>> {
        let result = self
            .request(
                Method::POST,
                &format!("/collections/{}/points", self.positions_collection),
                Some(json!({ "ids": [position_point_id(location)], "with_payload": true })),
                OnMissing::Empty,
            )
            .await?;
        if let Some(result) = result {
            let records: Vec<RecordPoint> = serde_json::from_value(result)?;
            if let Some(p) = records.into_iter().find_map(|r| r.payload) {
                return Ok(Some(LocationData::new(
                    location.world(),
                    p.primary_x,
                    p.primary_y,
                    p.primary_z,
                )?));
            }
        }
        Ok((self.count_at(location).await? > 0).then(|| location.clone()))
    }

    async fn count(&self) -> ChestResult<usize> {
        let result = self
            .request(
                Method::POST,
                &format!("/collections/{}/points/count", self.collection),
                Some(json!({ "exact": true })),
                OnMissing::Empty,
            )
            .await?;
        match result {
            Some(value) => Ok(serde_json::from_value::<CountResult>(value)?.count),
            None => Ok(0),
        }
    }
}
