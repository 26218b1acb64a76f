//! Embedded vector store in a single SQLite file
//!
//! Vectors are stored as little-endian f32 blobs and searched by brute-force
//! cosine similarity, which is fast enough for the few thousand containers a
//! world usually holds.
//!
//! rusqlite calls block, so every operation runs on tokio's blocking pool and
//! never stalls the workers driving debounce timers and embedding requests.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{max_index_by_location, rank_hits, similarity_score, cosine_similarity, VectorStorage};
use crate::container::{ContainerLocations, LocationData};
use crate::error::{ChestError, ChestResult};
use crate::search::types::{ContainerChunk, SearchFilter, SearchHit};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS container_chunks (
        world TEXT NOT NULL,
        x INTEGER NOT NULL,
        y INTEGER NOT NULL,
        z INTEGER NOT NULL,
        chunk_index INTEGER NOT NULL,
        text TEXT NOT NULL,
        content TEXT NOT NULL,
        vector BLOB NOT NULL,
        indexed_at INTEGER NOT NULL,
        PRIMARY KEY (world, x, y, z, chunk_index)
    );

    CREATE TABLE IF NOT EXISTS container_positions (
        world TEXT NOT NULL,
        x INTEGER NOT NULL,
        y INTEGER NOT NULL,
        z INTEGER NOT NULL,
        primary_x INTEGER NOT NULL,
        primary_y INTEGER NOT NULL,
        primary_z INTEGER NOT NULL,
        PRIMARY KEY (world, x, y, z)
    );

    CREATE INDEX IF NOT EXISTS idx_positions_primary
        ON container_positions(world, primary_x, primary_y, primary_z);
";

pub struct SqliteVectorStorage {
    conn: Arc<Mutex<Connection>>,
}

struct StoredRow {
    world: String,
    x: i32,
    y: i32,
    z: i32,
    chunk_index: u32,
    text: String,
    content: String,
    vector: Vec<u8>,
}

impl SqliteVectorStorage {
    /// Open or create the database file, creating parent directories
    pub fn open(path: &Path) -> ChestResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        log::info!("[Storage] Opened sqlite store at {:?}", path);
        Self::init(conn)
    }

    pub fn open_in_memory() -> ChestResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> ChestResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` with the connection on the blocking pool
    async fn blocking<T, F>(&self, op: F) -> ChestResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> ChestResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || op(&mut conn.lock()))
            .await
            .map_err(|e| ChestError::Storage(format!("sqlite task failed: {}", e)))?
    }
}

fn register_positions(conn: &mut Connection, locations: &ContainerLocations) -> ChestResult<()> {
    let primary = locations.primary_location();
    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM container_positions
         WHERE world = ?1 AND primary_x = ?2 AND primary_y = ?3 AND primary_z = ?4",
        params![primary.world(), primary.x, primary.y, primary.z],
    )?;
    for location in locations.all_locations() {
        tx.execute(
            "INSERT OR REPLACE INTO container_positions
             (world, x, y, z, primary_x, primary_y, primary_z)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                location.world(),
                location.x,
                location.y,
                location.z,
                primary.x,
                primary.y,
                primary.z
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}

fn upsert_chunks(conn: &mut Connection, chunks: &[ContainerChunk]) -> ChestResult<()> {
    let tx = conn.transaction()?;
    for chunk in chunks {
        tx.execute(
            "INSERT OR REPLACE INTO container_chunks
             (world, x, y, z, chunk_index, text, content, vector, indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                chunk.location.world(),
                chunk.location.x,
                chunk.location.y,
                chunk.location.z,
                chunk.chunk_index,
                chunk.text,
                chunk.content,
                encode_vector(&chunk.vector),
                chunk.indexed_at
            ],
        )?;
    }
    // Chunks past the new end belong to an older, longer version of the container
    for (location, max_index) in max_index_by_location(chunks) {
        tx.execute(
            "DELETE FROM container_chunks
             WHERE world = ?1 AND x = ?2 AND y = ?3 AND z = ?4 AND chunk_index > ?5",
            params![location.world(), location.x, location.y, location.z, max_index],
        )?;
    }
    tx.commit()?;
    Ok(())
}

fn delete_container(conn: &mut Connection, location: &LocationData) -> ChestResult<()> {
    let tx = conn.transaction()?;
    let removed = tx.execute(
        "DELETE FROM container_chunks WHERE world = ?1 AND x = ?2 AND y = ?3 AND z = ?4",
        params![location.world(), location.x, location.y, location.z],
    )?;
    tx.execute(
        "DELETE FROM container_positions
         WHERE world = ?1 AND ((x = ?2 AND y = ?3 AND z = ?4)
            OR (primary_x = ?2 AND primary_y = ?3 AND primary_z = ?4))",
        params![location.world(), location.x, location.y, location.z],
    )?;
    tx.commit()?;
    log::debug!("[Storage] Deleted {} chunks of {}", removed, location);
    Ok(())
}

fn search_chunks(
    conn: &Connection,
    query_vector: &[f32],
    limit: usize,
    filter: &SearchFilter,
) -> ChestResult<Vec<SearchHit>> {
    let mut stmt = conn.prepare(
        "SELECT world, x, y, z, chunk_index, text, content, vector
         FROM container_chunks WHERE (?1 IS NULL OR world = ?1)",
    )?;
    let rows = stmt
        .query_map(params![filter.world], |row| {
            Ok(StoredRow {
                world: row.get(0)?,
                x: row.get(1)?,
                y: row.get(2)?,
                z: row.get(3)?,
                chunk_index: row.get(4)?,
                text: row.get(5)?,
                content: row.get(6)?,
                vector: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut hits = Vec::new();
    for row in rows {
        let location = LocationData::new(row.world, row.x, row.y, row.z)?;
        if !filter.matches(&location) {
            continue;
        }
        let vector = decode_vector(&row.vector);
        let score = similarity_score(cosine_similarity(query_vector, &vector));
        hits.push(
            SearchHit::new(location, score, row.text)
                .with_content(row.content)
                .with_chunk_index(row.chunk_index),
        );
    }

    let mut hits = rank_hits(hits, limit);
    for hit in &mut hits {
        let blocks = positions_of(conn, &hit.location)?;
        hit.all_locations.extend(blocks);
    }
    Ok(hits)
}

fn resolve_primary(conn: &Connection, location: &LocationData) -> ChestResult<Option<LocationData>> {
    let primary = conn
        .query_row(
            "SELECT primary_x, primary_y, primary_z FROM container_positions
             WHERE world = ?1 AND x = ?2 AND y = ?3 AND z = ?4",
            params![location.world(), location.x, location.y, location.z],
            |row| Ok((row.get::<_, i32>(0)?, row.get::<_, i32>(1)?, row.get::<_, i32>(2)?)),
        )
        .optional()?;
    if let Some((x, y, z)) = primary {
        return Ok(Some(LocationData::new(location.world(), x, y, z)?));
    }

    // Containers indexed without a position mapping are their own primary
    let indexed: i64 = conn.query_row(
        "SELECT COUNT(*) FROM container_chunks WHERE world = ?1 AND x = ?2 AND y = ?3 AND z = ?4",
        params![location.world(), location.x, location.y, location.z],
        |row| row.get(0),
    )?;
    Ok((indexed > 0).then(|| location.clone()))
}

fn count_chunks(conn: &Connection) -> ChestResult<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM container_chunks", [], |row| row.get(0))?;
    Ok(count.max(0) as usize)
}

fn positions_of(conn: &Connection, primary: &LocationData) -> ChestResult<Vec<LocationData>> {
    let mut stmt = conn.prepare(
        "SELECT x, y, z FROM container_positions
         WHERE world = ?1 AND primary_x = ?2 AND primary_y = ?3 AND primary_z = ?4",
    )?;
    let coords = stmt
        .query_map(params![primary.world(), primary.x, primary.y, primary.z], |row| {
            Ok((row.get::<_, i32>(0)?, row.get::<_, i32>(1)?, row.get::<_, i32>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    coords
        .into_iter()
        .map(|(x, y, z)| LocationData::new(primary.world(), x, y, z))
        .collect()
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[async_trait]
impl VectorStorage for SqliteVectorStorage {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn register_container_positions(&self, locations: &ContainerLocations) -> ChestResult<()> {
        let locations = locations.clone();
        self.blocking(move |conn| register_positions(conn, &locations))
            .await
    }

    async fn index_chunks(&self, chunks: &[ContainerChunk]) -> ChestResult<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let chunks = chunks.to_vec();
        self.blocking(move |conn| upsert_chunks(conn, &chunks)).await
    }

    async fn delete(&self, location: &LocationData) -> ChestResult<()> {
        let location = location.clone();
        self.blocking(move |conn| delete_container(conn, &location))
            .await
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
        let query_vector = query_vector.to_vec();
        let filter = filter.clone();
        self.blocking(move |conn| search_chunks(conn, &query_vector, limit, &filter))
            .await
    }

    async fn resolve_primary(&self, location: &LocationData) -> ChestResult<Option<LocationData>> {
        let location = location.clone();
        self.blocking(move |conn| resolve_primary(conn, &location))
            .await
    }

    async fn count(&self) -> ChestResult<usize> {
        self.blocking(|conn| count_chunks(conn)).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tempfile::TempDir;

    fn loc(x: i32, y: i32, z: i32) -> LocationData {
        LocationData::new("overworld", x, y, z).unwrap()
    }

    fn chunk(location: LocationData, chunk_index: u32, text: &str, vector: Vec<f32>) -> ContainerChunk {
        ContainerChunk {
            location,
            chunk_index,
            text: text.to_string(),
            content: format!("[{{\"display_name\":\"{}\"}}]", text),
            vector,
            indexed_at: 1,
        }
    }

    #[test]
    fn test_vector_blob_roundtrip() {
        let vector = vec![0.5, -1.25, 3.0];
        let bytes = encode_vector(&vector);
        assert_eq!(bytes.len(), 12);
        assert_eq!(decode_vector(&bytes), vector);
    }

    #[tokio::test]
    async fn test_search_ranks_by_similarity() {
        let storage = SqliteVectorStorage::open_in_memory().unwrap();
        storage
            .index_chunks(&[
                chunk(loc(0, 64, 0), 0, "diamond sword #weapon", vec![1.0, 0.0]),
                chunk(loc(5, 64, 0), 0, "bread #food", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = storage.search(&[0.9, 0.1], 10, &SearchFilter::default()).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].location, loc(0, 64, 0));
        assert!(hits[0].score > hits[1].score);
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
        assert!(hits[0].content.as_deref().unwrap().contains("diamond sword"));
    }

    #[tokio::test]
    async fn test_reindex_drops_trailing_chunks() {
        let storage = SqliteVectorStorage::open_in_memory().unwrap();
        let location = loc(1, 2, 3);
        storage
            .index_chunks(&[
                chunk(location.clone(), 0, "a", vec![1.0]),
                chunk(location.clone(), 1, "b", vec![1.0]),
                chunk(location.clone(), 2, "c", vec![1.0]),
            ])
            .await
            .unwrap();
        assert_eq!(storage.count().await.unwrap(), 3);

        storage
            .index_chunks(&[chunk(location.clone(), 0, "replaced", vec![1.0])])
            .await
            .unwrap();
        assert_eq!(storage.count().await.unwrap(), 1);

        let hits = storage.search(&[1.0], 5, &SearchFilter::default()).await.unwrap();
        assert_eq!(hits[0].preview, "replaced");
    }

    #[tokio::test]
    async fn test_positions_resolve_and_delete() {
        let storage = SqliteVectorStorage::open_in_memory().unwrap();
        let primary = loc(10, 64, 0);
        let other = loc(11, 64, 0);
        storage
            .register_container_positions(&ContainerLocations::new(primary.clone(), [other.clone()]))
            .await
            .unwrap();
        storage
            .index_chunks(&[chunk(primary.clone(), 0, "iron ingot", vec![1.0, 1.0])])
            .await
            .unwrap();

        assert_eq!(storage.resolve_primary(&other).await.unwrap(), Some(primary.clone()));
        assert_eq!(storage.resolve_primary(&loc(99, 0, 0)).await.unwrap(), None);

        let hits = storage.search(&[1.0, 1.0], 5, &SearchFilter::default()).await.unwrap();
        assert!(hits[0].all_locations.contains(&other));
        assert_eq!(hits[0].all_locations.len(), 2);

        storage.delete(&primary).await.unwrap();
        assert_eq!(storage.count().await.unwrap(), 0);
        assert_eq!(storage.resolve_primary(&other).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_register_is_idempotent_and_replaces_old_mapping() {
        let storage = SqliteVectorStorage::open_in_memory().unwrap();
        let primary = loc(0, 64, 0);
        let double = ContainerLocations::new(primary.clone(), [loc(1, 64, 0)]);
        storage.register_container_positions(&double).await.unwrap();
        storage.register_container_positions(&double).await.unwrap();

        storage
            .register_container_positions(&ContainerLocations::single(primary.clone()))
            .await
            .unwrap();
        assert_eq!(storage.resolve_primary(&loc(1, 64, 0)).await.unwrap(), None);
        assert_eq!(storage.resolve_primary(&primary).await.unwrap(), Some(primary));
    }

    #[tokio::test]
    async fn test_filter_by_world_and_radius() {
        let storage = SqliteVectorStorage::open_in_memory().unwrap();
        let nether = LocationData::new("nether", 0, 64, 0).unwrap();
        storage
            .index_chunks(&[
                chunk(loc(0, 64, 0), 0, "near", vec![1.0]),
                chunk(loc(100, 64, 0), 0, "far", vec![1.0]),
                chunk(nether, 0, "nether", vec![1.0]),
            ])
            .await
            .unwrap();

        let overworld = storage.search(&[1.0], 10, &SearchFilter::world("overworld")).await.unwrap();
        assert_eq!(overworld.len(), 2);

        let near = storage
            .search(&[1.0], 10, &SearchFilter::near(loc(0, 64, 0), 16))
            .await
            .unwrap();
        assert_eq!(near.len(), 1);
        assert_eq!(near[0].preview, "near");
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("chunks.db");
        {
            let storage = SqliteVectorStorage::open(&path).unwrap();
            storage
                .index_chunks(&[chunk(loc(0, 0, 0), 0, "stone", vec![1.0])])
                .await
                .unwrap();
        }
        let storage = SqliteVectorStorage::open(&path).unwrap();
        assert_eq!(storage.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_busy_database_does_not_stall_the_runtime() {
        let storage = Arc::new(SqliteVectorStorage::open_in_memory().unwrap());
        // Stands in for a long-running statement
        let busy = storage.conn.lock();

        let count = tokio::spawn({
            let storage = storage.clone();
            async move { storage.count().await }
        });
        // Timers on this single-threaded runtime keep firing meanwhile
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!count.is_finished());

        drop(busy);
        assert_eq!(count.await.unwrap().unwrap(), 0);
    }
}
