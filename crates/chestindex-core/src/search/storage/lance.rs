//! LanceDB vector store

use std::path::PathBuf;
use std::sync::Arc;

use arrow_array::{
    types::Float32Type, Array, FixedSizeListArray, Float32Array, Int32Array, Int64Array,
    RecordBatch, RecordBatchIterator, StringArray, UInt32Array,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection, Table};
use tokio::sync::Mutex;

use super::{rank_hits, VectorStorage};
use crate::container::{ContainerLocations, LocationData};
use crate::error::{ChestError, ChestResult};
use crate::search::types::{ContainerChunk, SearchFilter, SearchHit};

struct LanceState {
    db: Connection,
    chunks: Option<Table>,
    positions: Option<Table>,
}

/// LanceDB vector store. Tables are created on first write; the chunk table
/// takes its vector width from the first indexed chunk.
pub struct LanceVectorStorage {
    chunks_table: String,
    positions_table: String,
    state: Mutex<LanceState>,
}

impl LanceVectorStorage {
    pub async fn open(db_path: PathBuf, collection: &str) -> ChestResult<Self> {
        std::fs::create_dir_all(&db_path)?;

        let db = connect(db_path.to_string_lossy().as_ref()).execute().await?;
        let chunks_table = collection.to_string();
        let positions_table = format!("{}_positions", collection);

        let table_names = db.table_names().execute().await?;
        let chunks = if table_names.contains(&chunks_table) {
            Some(db.open_table(&chunks_table).execute().await?)
        } else {
            None
        };
        let positions = if table_names.contains(&positions_table) {
            Some(db.open_table(&positions_table).execute().await?)
        } else {
            None
        };

        log::info!("[Storage] Opened lancedb store at {:?}", db_path);
        Ok(Self {
            chunks_table,
            positions_table,
            state: Mutex::new(LanceState {
                db,
                chunks,
                positions,
            }),
        })
    }

    fn chunk_schema(dimensions: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("world", DataType::Utf8, false),
            Field::new("x", DataType::Int32, false),
            Field::new("y", DataType::Int32, false),
            Field::new("z", DataType::Int32, false),
            Field::new("chunk_index", DataType::UInt32, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("content", DataType::Utf8, false),
            Field::new("indexed_at", DataType::Int64, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimensions as i32,
                ),
                false,
            ),
        ]))
    }

    fn position_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("world", DataType::Utf8, false),
            Field::new("x", DataType::Int32, false),
            Field::new("y", DataType::Int32, false),
            Field::new("z", DataType::Int32, false),
            Field::new("primary_x", DataType::Int32, false),
            Field::new("primary_y", DataType::Int32, false),
            Field::new("primary_z", DataType::Int32, false),
        ]))
    }

    fn chunks_to_batch(chunks: &[ContainerChunk], dimensions: usize) -> ChestResult<RecordBatch> {
        if let Some(bad) = chunks.iter().find(|c| c.vector.len() != dimensions) {
            return Err(ChestError::Storage(format!(
                "vector width {} does not match table width {}",
                bad.vector.len(),
                dimensions
            )));
        }

        let worlds: Vec<&str> = chunks.iter().map(|c| c.location.world()).collect();
        let xs: Vec<i32> = chunks.iter().map(|c| c.location.x).collect();
        let ys: Vec<i32> = chunks.iter().map(|c| c.location.y).collect();
        let zs: Vec<i32> = chunks.iter().map(|c| c.location.z).collect();
        let chunk_indices: Vec<u32> = chunks.iter().map(|c| c.chunk_index).collect();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        let indexed_at: Vec<i64> = chunks.iter().map(|c| c.indexed_at).collect();

        let vectors_array = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
            chunks
                .iter()
                .map(|c| Some(c.vector.iter().copied().map(Some).collect::<Vec<_>>())),
            dimensions as i32,
        );

        RecordBatch::try_new(
            Self::chunk_schema(dimensions),
            vec![
                Arc::new(StringArray::from(worlds)),
                Arc::new(Int32Array::from(xs)),
                Arc::new(Int32Array::from(ys)),
                Arc::new(Int32Array::from(zs)),
                Arc::new(UInt32Array::from(chunk_indices)),
                Arc::new(StringArray::from(texts)),
                Arc::new(StringArray::from(contents)),
                Arc::new(Int64Array::from(indexed_at)),
                Arc::new(vectors_array),
            ],
        )
        .map_err(|e| ChestError::Storage(e.to_string()))
    }

    fn positions_to_batch(locations: &ContainerLocations) -> ChestResult<RecordBatch> {
        let primary = locations.primary_location();
        let all: Vec<&LocationData> = locations.all_locations().iter().collect();
        let n = all.len();

        RecordBatch::try_new(
            Self::position_schema(),
            vec![
                Arc::new(StringArray::from(all.iter().map(|l| l.world()).collect::<Vec<_>>())),
                Arc::new(Int32Array::from(all.iter().map(|l| l.x).collect::<Vec<_>>())),
                Arc::new(Int32Array::from(all.iter().map(|l| l.y).collect::<Vec<_>>())),
                Arc::new(Int32Array::from(all.iter().map(|l| l.z).collect::<Vec<_>>())),
                Arc::new(Int32Array::from(vec![primary.x; n])),
                Arc::new(Int32Array::from(vec![primary.y; n])),
                Arc::new(Int32Array::from(vec![primary.z; n])),
            ],
        )
        .map_err(|e| ChestError::Storage(e.to_string()))
    }

    async fn positions_of(table: &Table, primary: &LocationData) -> ChestResult<Vec<LocationData>> {
        let batches = table
            .query()
            .only_if(primary_predicate(primary))
            .execute()
            .await?
            .try_collect::<Vec<_>>()
            .await?;

        let mut locations = Vec::new();
        for batch in batches {
            let xs = int_column(&batch, "x")?;
            let ys = int_column(&batch, "y")?;
            let zs = int_column(&batch, "z")?;
            for i in 0..batch.num_rows() {
                locations.push(LocationData::new(
                    primary.world(),
                    xs.value(i),
                    ys.value(i),
                    zs.value(i),
                )?);
            }
        }
        Ok(locations)
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn location_predicate(location: &LocationData) -> String {
    format!(
        "world = {} AND x = {} AND y = {} AND z = {}",
        quote(location.world()),
        location.x,
        location.y,
        location.z
    )
}

fn primary_predicate(primary: &LocationData) -> String {
    format!(
        "world = {} AND primary_x = {} AND primary_y = {} AND primary_z = {}",
        quote(primary.world()),
        primary.x,
        primary.y,
        primary.z
    )
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> ChestResult<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| ChestError::Storage(format!("Missing {} column", name)))
}

fn int_column<'a>(batch: &'a RecordBatch, name: &str) -> ChestResult<&'a Int32Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
        .ok_or_else(|| ChestError::Storage(format!("Missing {} column", name)))
}

#[async_trait]
impl VectorStorage for LanceVectorStorage {
    fn name(&self) -> &str {
        "lancedb"
    }

    async fn register_container_positions(&self, locations: &ContainerLocations) -> ChestResult<()> {
        let batch = Self::positions_to_batch(locations)?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], Self::position_schema());

        let mut state = self.state.lock().await;
        match state.positions {
            Some(ref table) => {
                table
                    .delete(&primary_predicate(locations.primary_location()))
                    .await?;
                table.add(Box::new(batches)).execute().await?;
            }
            None => {
                let table = state
                    .db
                    .create_table(&self.positions_table, Box::new(batches))
                    .execute()
                    .await?;
                state.positions = Some(table);
            }
        }
        Ok(())
    }

    async fn index_chunks(&self, chunks: &[ContainerChunk]) -> ChestResult<()> {
        let Some(first) = chunks.first() else {
            return Ok(());
        };
        let dimensions = first.vector.len();
        let batch = Self::chunks_to_batch(chunks, dimensions)?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], Self::chunk_schema(dimensions));

        let mut state = self.state.lock().await;
        match state.chunks {
            Some(ref table) => {
                // Replacing every chunk of the touched containers also drops
                // chunks past their new end.
                let mut touched: Vec<&LocationData> = chunks.iter().map(|c| &c.location).collect();
                touched.dedup();
                for location in touched {
                    table.delete(&location_predicate(location)).await?;
                }
                table.add(Box::new(batches)).execute().await?;
            }
            None => {
                let table = state
                    .db
                    .create_table(&self.chunks_table, Box::new(batches))
                    .execute()
                    .await?;
                state.chunks = Some(table);
            }
        }
        Ok(())
    }

    async fn delete(&self, location: &LocationData) -> ChestResult<()> {
        let state = self.state.lock().await;
        if let Some(ref table) = state.chunks {
            table.delete(&location_predicate(location)).await?;
        }
        if let Some(ref table) = state.positions {
            table.delete(&location_predicate(location)).await?;
            table.delete(&primary_predicate(location)).await?;
        }
        Ok(())
    }

    async fn search(
        &self,
        query_vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
    ) -> ChestResult<Vec<SearchHit>> {
        let state = self.state.lock().await;
        let Some(ref table) = state.chunks else {
            return Ok(vec![]);
        };
        if limit == 0 {
            return Ok(vec![]);
        }

        let mut query = table.vector_search(query_vector.to_vec())?.limit(limit);
        if let Some(ref world) = filter.world {
            query = query.only_if(format!("world = {}", quote(world)));
        }
        let results = query.execute().await?.try_collect::<Vec<_>>().await?;

        let mut hits = Vec::new();
        for batch in results {
            let worlds = string_column(&batch, "world")?;
            let xs = int_column(&batch, "x")?;
            let ys = int_column(&batch, "y")?;
            let zs = int_column(&batch, "z")?;
            let texts = string_column(&batch, "text")?;
            let contents = string_column(&batch, "content")?;
            let chunk_indices = batch
                .column_by_name("chunk_index")
                .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
                .ok_or_else(|| ChestError::Storage("Missing chunk_index column".to_string()))?;

            // LanceDB returns _distance column for vector search
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

            for i in 0..batch.num_rows() {
                let location = LocationData::new(worlds.value(i), xs.value(i), ys.value(i), zs.value(i))?;
                if !filter.matches(&location) {
                    continue;
                }
                // score = 1 / (1 + distance) keeps scores in (0, 1]
                let score = distances
                    .filter(|d| !d.is_null(i))
                    .map(|d| 1.0 / (1.0 + d.value(i).max(0.0)))
                    .unwrap_or(0.5);
                hits.push(
                    SearchHit::new(location, score, texts.value(i))
                        .with_content(contents.value(i))
                        .with_chunk_index(chunk_indices.value(i)),
                );
            }
        }

        let mut hits = rank_hits(hits, limit);
        if let Some(ref positions) = state.positions {
            for hit in &mut hits {
                let blocks = Self::positions_of(positions, &hit.location).await?;
                hit.all_locations.extend(blocks);
            }
        }
        Ok(hits)
    }

    async fn resolve_primary(&self, location: &LocationData) -> ChestResult<Option<LocationData>> {
        let state = self.state.lock().await;
        if let Some(ref table) = state.positions {
            let batches = table
                .query()
                .only_if(location_predicate(location))
                .limit(1)
                .execute()
                .await?
                .try_collect::<Vec<_>>()
                .await?;
            for batch in batches {
                if batch.num_rows() == 0 {
                    continue;
                }
                let x = int_column(&batch, "primary_x")?.value(0);
                let y = int_column(&batch, "primary_y")?.value(0);
                let z = int_column(&batch, "primary_z")?.value(0);
                return Ok(Some(LocationData::new(location.world(), x, y, z)?));
            }
        }
        if let Some(ref table) = state.chunks {
            let count = table
                .count_rows(Some(location_predicate(location)))
                .await?;
            if count > 0 {
                return Ok(Some(location.clone()));
            }
        }
        Ok(None)
    }

    async fn count(&self) -> ChestResult<usize> {
        let state = self.state.lock().await;
        match state.chunks {
            Some(ref table) => Ok(table.count_rows(None).await?),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn loc(x: i32, y: i32, z: i32) -> LocationData {
        LocationData::new("overworld", x, y, z).unwrap()
    }

    #[test]
    fn test_predicates_escape_world() {
        let location = LocationData::new("bob's world", 1, -2, 3).unwrap();
        assert_eq!(
            location_predicate(&location),
            "world = 'bob''s world' AND x = 1 AND y = -2 AND z = 3"
        );
    }

    #[tokio::test]
    async fn test_index_search_and_delete() {
        let dir = TempDir::new().unwrap();
        let storage = LanceVectorStorage::open(dir.path().join("lance"), "chunks")
            .await
            .unwrap();
        let chunk = ContainerChunk {
            location: loc(0, 64, 0),
            chunk_index: 0,
            text: "diamond sword #weapon".to_string(),
            content: "[]".to_string(),
            vector: vec![1.0, 0.0, 0.0],
            indexed_at: 1,
        };
        storage.index_chunks(&[chunk.clone()]).await.unwrap();
        storage.index_chunks(&[chunk]).await.unwrap();
        assert_eq!(storage.count().await.unwrap(), 1);

        let hits = storage
            .search(&[1.0, 0.0, 0.0], 5, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.9);

        storage.delete(&loc(0, 64, 0)).await.unwrap();
        assert_eq!(storage.count().await.unwrap(), 0);
    }
}
