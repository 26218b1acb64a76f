//! Debounced container indexer
//!
//! Every container (keyed by primary location) moves through
//! Idle -> Pending -> Indexing -> Idle. A new schedule request replaces the
//! pending one, so only the settled contents after a quiet period are embedded.
//!
//! Each request takes a fresh generation number. A run only writes to storage
//! while its generation is still the current one for the location, which keeps
//! an older run from overwriting a newer index even if it was already embedding
//! when it was superseded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use super::chunks::ChunkBuilder;
use super::config::IndexerConfig;
use super::embedding::EmbeddingService;
use super::storage::VectorStorage;
use super::types::{now_millis, ContainerChunk, EmbeddingTask};
use crate::container::{ContainerLocations, LocationData, SerializedItem};
use crate::error::ChestResult;

/// Scheduling state of one container
struct TaskSlot {
    /// Generation of the most recent request
    generation: u64,
    /// Debounce timer that has not fired yet
    pending: Option<JoinHandle<()>>,
    /// Index runs past their timer plus deletes not yet settled
    in_flight: usize,
    /// Serializes storage writes for this container
    write_gate: Arc<tokio::sync::Mutex<()>>,
}

impl TaskSlot {
    fn new() -> Self {
        Self {
            generation: 0,
            pending: None,
            in_flight: 0,
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

struct IndexerInner {
    embedding: Arc<dyn EmbeddingService>,
    storage: Arc<dyn VectorStorage>,
    chunk_builder: ChunkBuilder,
    debounce: Duration,
    shutdown_grace: Duration,
    tasks: Mutex<HashMap<LocationData, TaskSlot>>,
    /// Tasks shutdown waits for: started runs, deletes and registrations
    running: Mutex<Vec<JoinHandle<()>>>,
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
}

/// Turns container contents into stored vectors in the background.
///
/// All public methods return immediately and never fail; background errors
/// are logged with the container location and dropped.
pub struct ContainerIndexer {
    runtime: Mutex<Option<Runtime>>,
    inner: Arc<IndexerInner>,
}

impl ContainerIndexer {
    /// Create an indexer with its own worker pool
    pub fn new(
        embedding: Arc<dyn EmbeddingService>,
        storage: Arc<dyn VectorStorage>,
        config: &IndexerConfig,
    ) -> ChestResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads())
            .thread_name("chestindex-worker")
            .enable_all()
            .build()?;
        Ok(Self::with_runtime(runtime, embedding, storage, config))
    }

    /// Create an indexer that runs on (and owns) an existing runtime
    pub fn with_runtime(
        runtime: Runtime,
        embedding: Arc<dyn EmbeddingService>,
        storage: Arc<dyn VectorStorage>,
        config: &IndexerConfig,
    ) -> Self {
        log::info!(
            "[Indexer] Started ({} ms debounce, {} embedding, {} storage)",
            config.debounce_ms,
            embedding.name(),
            storage.name()
        );
        Self {
            runtime: Mutex::new(Some(runtime)),
            inner: Arc::new(IndexerInner {
                embedding,
                storage,
                chunk_builder: ChunkBuilder::new(config.max_chunk_chars),
                debounce: config.debounce(),
                shutdown_grace: config.shutdown_grace(),
                tasks: Mutex::new(HashMap::new()),
                running: Mutex::new(Vec::new()),
                next_generation: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Handle of the worker pool, `None` after shutdown
    pub fn runtime_handle(&self) -> Option<Handle> {
        self.runtime.lock().as_ref().map(|rt| rt.handle().clone())
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Containers waiting out their debounce delay
    pub fn pending_count(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .values()
            .filter(|slot| slot.pending.is_some())
            .count()
    }

    /// Containers with any scheduling state (pending or indexing)
    pub fn active_count(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Schedule (re)indexing of a container.
    ///
    /// Empty `items` removes the container from the index right away instead
    /// of waiting for the debounce delay.
    pub fn schedule_index(&self, locations: ContainerLocations, items: Vec<SerializedItem>) {
        let runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_ref() else {
            log::debug!(
                "[Indexer] Ignoring schedule for {} after shutdown",
                locations.primary_location()
            );
            return;
        };
        let inner = &self.inner;
        let primary = locations.primary_location().clone();

        if items.is_empty() {
            let (generation, gate) = inner.supersede(&mut inner.tasks.lock(), &primary, true);
            let task_inner = inner.clone();
            let task_primary = primary.clone();
            let handle = runtime.spawn(async move {
                // Registration runs first so the delete also clears the fresh mapping
                task_inner.register(&locations).await;
                task_inner.delete_if_current(&task_primary, generation, gate).await;
                task_inner.finish(&task_primary);
            });
            inner.track_running(handle);
            log::debug!("[Indexer] {} emptied, removing from index", primary);
            return;
        }

        let register_inner = inner.clone();
        let register_locations = locations.clone();
        let registration = runtime.spawn(async move {
            register_inner.register(&register_locations).await;
        });
        inner.track_running(registration);

        let mut tasks = inner.tasks.lock();
        let (generation, _) = inner.supersede(&mut tasks, &primary, false);
        let task_inner = inner.clone();
        let handle = runtime.spawn(async move {
            task_inner.run(locations, items, generation).await;
        });
        if let Some(slot) = tasks.get_mut(&primary) {
            slot.pending = Some(handle);
        }
        log::debug!("[Indexer] Scheduled {} (generation {})", primary, generation);
    }

    /// Remove a destroyed container. `location` may be any block of it.
    pub fn remove_container(&self, location: LocationData) {
        let runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_ref() else {
            return;
        };
        let inner = self.inner.clone();
        let handle = runtime.spawn(async move {
            let primary = match inner.storage.resolve_primary(&location).await {
                Ok(Some(primary)) => primary,
                Ok(None) => location.clone(),
                Err(e) => {
                    log::warn!(
                        "[Indexer] Failed to resolve primary of {}: {}",
                        location,
                        e
                    );
                    location.clone()
                }
            };
            let (generation, gate) = {
                let mut tasks = inner.tasks.lock();
                inner.supersede(&mut tasks, &primary, true)
            };
            inner.delete_if_current(&primary, generation, gate).await;
            inner.finish(&primary);
        });
        self.inner.track_running(handle);
    }

    /// Cancel pending timers, wait for running work up to the grace period,
    /// then stop the worker pool. Calling it again does nothing.
    ///
    /// Blocks the calling thread; do not call from inside an async task.
    pub fn shutdown(&self) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let cancelled = self.inner.cancel_pending();
        let running: Vec<JoinHandle<()>> = self.inner.running.lock().drain(..).collect();
        log::info!(
            "[Indexer] Shutting down: {} pending cancelled, {} running",
            cancelled,
            running.len()
        );

        let grace = self.inner.shutdown_grace;
        let drained = runtime.block_on(async move {
            tokio::time::timeout(grace, join_all(running)).await.is_ok()
        });
        if !drained {
            log::warn!(
                "[Indexer] Running work did not finish within {:?}, terminating",
                grace
            );
        }
        runtime.shutdown_timeout(Duration::from_millis(100));
        log::info!("[Indexer] Stopped");
    }
}

impl Drop for ContainerIndexer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.lock().take() {
            self.inner.shutting_down.store(true, Ordering::SeqCst);
            self.inner.cancel_pending();
            // Never blocks, so dropping inside an async context is fine
            runtime.shutdown_background();
        }
    }
}

impl IndexerInner {
    /// Start a new generation for `primary` and cancel its pending timer.
    /// `immediate` marks work that starts now instead of after the debounce
    /// delay; it must be settled with [`IndexerInner::finish`].
    fn supersede(
        &self,
        tasks: &mut HashMap<LocationData, TaskSlot>,
        primary: &LocationData,
        immediate: bool,
    ) -> (u64, Arc<tokio::sync::Mutex<()>>) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let slot = tasks.entry(primary.clone()).or_insert_with(TaskSlot::new);
        slot.generation = generation;
        if let Some(pending) = slot.pending.take() {
            pending.abort();
        }
        if immediate {
            slot.in_flight += 1;
        }
        (generation, slot.write_gate.clone())
    }

    fn is_current(&self, primary: &LocationData, generation: u64) -> bool {
        self.tasks
            .lock()
            .get(primary)
            .map(|slot| slot.generation == generation)
            .unwrap_or(false)
    }

    /// Settle one in-flight run; the slot goes away once nothing references it
    fn finish(&self, primary: &LocationData) {
        let mut tasks = self.tasks.lock();
        if let Some(slot) = tasks.get_mut(primary) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
            if slot.in_flight == 0 && slot.pending.is_none() {
                tasks.remove(primary);
            }
        }
    }

    /// Abort every pending timer; returns how many were cancelled
    fn cancel_pending(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let mut cancelled = 0;
        for slot in tasks.values_mut() {
            if let Some(pending) = slot.pending.take() {
                pending.abort();
                cancelled += 1;
            }
        }
        tasks.retain(|_, slot| slot.in_flight > 0);
        cancelled
    }

    fn track_running(&self, handle: JoinHandle<()>) {
        let mut running = self.running.lock();
        running.retain(|h| !h.is_finished());
        running.push(handle);
    }

    async fn register(&self, locations: &ContainerLocations) {
        if let Err(e) = self.storage.register_container_positions(locations).await {
            log::warn!(
                "[Indexer] Failed to register positions of {}: {}",
                locations.primary_location(),
                e
            );
        }
    }

    async fn delete_if_current(
        &self,
        primary: &LocationData,
        generation: u64,
        gate: Arc<tokio::sync::Mutex<()>>,
    ) {
        let _write = gate.lock().await;
        if !self.is_current(primary, generation) {
            return;
        }
        match self.storage.delete(primary).await {
            Ok(()) => log::debug!("[Indexer] Removed {} from index", primary),
            Err(e) => log::warn!("[Indexer] Failed to remove {}: {}", primary, e),
        }
    }

    /// Debounce, embed and store one request
    async fn run(self: Arc<Self>, locations: ContainerLocations, items: Vec<SerializedItem>, generation: u64) {
        tokio::time::sleep(self.debounce).await;

        let primary = locations.primary_location().clone();
        let gate = {
            let mut tasks = self.tasks.lock();
            let Some(slot) = tasks.get_mut(&primary) else {
                return;
            };
            if slot.generation != generation {
                return;
            }
            // Pending -> Indexing: past this point the run is no longer cancelled
            if let Some(handle) = slot.pending.take() {
                self.track_running(handle);
            }
            slot.in_flight += 1;
            slot.write_gate.clone()
        };

        match self.embed_chunks(&primary, &items).await {
            Ok(chunks) => {
                let _write = gate.lock().await;
                if !self.is_current(&primary, generation) {
                    log::debug!(
                        "[Indexer] Dropping superseded index of {} (generation {})",
                        primary,
                        generation
                    );
                } else {
                    match self.storage.index_chunks(&chunks).await {
                        Ok(()) => log::debug!(
                            "[Indexer] Indexed {} ({} items, {} chunks)",
                            primary,
                            items.len(),
                            chunks.len()
                        ),
                        Err(e) => log::warn!("[Indexer] Failed to store {}: {}", primary, e),
                    }
                }
            }
            Err(e) => log::warn!("[Indexer] Failed to embed {}: {}", primary, e),
        }

        self.finish(&primary);
    }

    /// One embedding call per chunk, all in flight at once. Any failure fails
    /// the whole run so a container is never stored half-embedded.
    async fn embed_chunks(
        &self,
        primary: &LocationData,
        items: &[SerializedItem],
    ) -> ChestResult<Vec<ContainerChunk>> {
        let pending = self.chunk_builder.build(items);
        let vectors = join_all(
            pending
                .iter()
                .map(|chunk| self.embedding.embed(&chunk.text, EmbeddingTask::Document)),
        )
        .await;

        let indexed_at = now_millis();
        pending
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| {
                Ok(ContainerChunk {
                    location: primary.clone(),
                    chunk_index: chunk.chunk_index,
                    text: chunk.text,
                    content: chunk.content,
                    vector: vector?,
                    indexed_at,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;

    use super::*;
    use crate::container::ContainerPath;
    use crate::search::testing::{FailingEmbedder, KeywordEmbedder, RecordingStorage, SlowEmbedder};

    fn loc(x: i32) -> LocationData {
        LocationData::new("overworld", x, 64, 0).unwrap()
    }

    fn items(texts: &[&str]) -> Vec<SerializedItem> {
        texts
            .iter()
            .map(|t| SerializedItem {
                embedding_text: t.to_string(),
                storage_json: format!("{{\"display_name\":\"{}\"}}", t),
                container_path: ContainerPath::ROOT,
            })
            .collect()
    }

    fn config(debounce_ms: u64) -> IndexerConfig {
        IndexerConfig {
            debounce_ms,
            ..Default::default()
        }
    }

    fn indexer(
        embedding: Arc<dyn EmbeddingService>,
        storage: Arc<RecordingStorage>,
        debounce_ms: u64,
    ) -> ContainerIndexer {
        ContainerIndexer::new(embedding, storage, &config(debounce_ms)).unwrap()
    }

    #[test]
    fn test_rapid_schedules_write_once_with_last_items() {
        let storage = Arc::new(RecordingStorage::new());
        let indexer = indexer(Arc::new(KeywordEmbedder), storage.clone(), 100);
        let locations = ContainerLocations::single(loc(0));

        indexer.schedule_index(locations.clone(), items(&["stone"]));
        indexer.schedule_index(locations.clone(), items(&["stone", "dirt"]));
        indexer.schedule_index(locations, items(&["diamond sword #weapon"]));
        assert_eq!(indexer.pending_count(), 1);

        sleep(Duration::from_millis(600));
        assert_eq!(storage.write_count(), 1);
        let written = storage.last_write();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].text, "diamond sword #weapon");
        assert_eq!(written[0].location, loc(0));
        assert_eq!(indexer.active_count(), 0);
        indexer.shutdown();
    }

    #[test]
    fn test_empty_items_delete_without_debounce() {
        let storage = Arc::new(RecordingStorage::new());
        let indexer = indexer(Arc::new(KeywordEmbedder), storage.clone(), 10_000);

        indexer.schedule_index(ContainerLocations::single(loc(3)), vec![]);
        sleep(Duration::from_millis(300));
        assert_eq!(storage.deleted(), vec![loc(3)]);
        assert_eq!(storage.write_count(), 0);
        indexer.shutdown();
    }

    #[test]
    fn test_emptying_cancels_pending_index() {
        let storage = Arc::new(RecordingStorage::new());
        let indexer = indexer(Arc::new(KeywordEmbedder), storage.clone(), 200);
        let locations = ContainerLocations::single(loc(1));

        indexer.schedule_index(locations.clone(), items(&["stone"]));
        indexer.schedule_index(locations, vec![]);
        sleep(Duration::from_millis(600));
        assert_eq!(storage.write_count(), 0);
        assert_eq!(storage.delete_count(), 1);
        indexer.shutdown();
    }

    #[test]
    fn test_locations_index_independently() {
        let storage = Arc::new(RecordingStorage::new());
        let indexer = indexer(Arc::new(KeywordEmbedder), storage.clone(), 50);

        indexer.schedule_index(ContainerLocations::single(loc(0)), items(&["stone"]));
        indexer.schedule_index(ContainerLocations::single(loc(1)), items(&["dirt"]));
        sleep(Duration::from_millis(500));
        assert_eq!(storage.write_count(), 2);
        assert_eq!(storage.stored_chunks(), 2);
        assert_eq!(storage.registration_count(), 2);
        indexer.shutdown();
    }

    #[test]
    fn test_nested_items_keep_chunk_order() {
        let storage = Arc::new(RecordingStorage::new());
        let indexer = indexer(Arc::new(KeywordEmbedder), storage.clone(), 20);
        let mut all = items(&["stone"]);
        all.push(SerializedItem {
            embedding_text: "diamond".to_string(),
            storage_json: "{}".to_string(),
            container_path: ContainerPath::ROOT.push(crate::container::ContainerNode::new("shulker_box")),
        });

        indexer.schedule_index(ContainerLocations::single(loc(0)), all);
        sleep(Duration::from_millis(400));
        let written = storage.last_write();
        let order: Vec<(u32, &str)> = written
            .iter()
            .map(|c| (c.chunk_index, c.text.as_str()))
            .collect();
        assert_eq!(order, vec![(0, "stone"), (1, "diamond")]);
        indexer.shutdown();
    }

    #[test]
    fn test_embedding_failure_is_swallowed() {
        let storage = Arc::new(RecordingStorage::new());
        let indexer = indexer(Arc::new(FailingEmbedder), storage.clone(), 20);

        indexer.schedule_index(ContainerLocations::single(loc(0)), items(&["stone"]));
        sleep(Duration::from_millis(300));
        assert_eq!(storage.write_count(), 0);
        assert_eq!(indexer.active_count(), 0);
        indexer.shutdown();
    }

    #[test]
    fn test_storage_failure_is_swallowed() {
        let storage = Arc::new(RecordingStorage::failing());
        let indexer = indexer(Arc::new(KeywordEmbedder), storage.clone(), 20);

        indexer.schedule_index(ContainerLocations::single(loc(0)), items(&["stone"]));
        indexer.schedule_index(ContainerLocations::single(loc(1)), vec![]);
        sleep(Duration::from_millis(300));
        assert_eq!(storage.write_count(), 1);
        assert_eq!(storage.delete_count(), 1);
        assert_eq!(indexer.active_count(), 0);
        indexer.shutdown();
    }

    #[test]
    fn test_superseded_run_drops_its_write() {
        let storage = Arc::new(RecordingStorage::new());
        let embedding = Arc::new(SlowEmbedder::new(Duration::from_millis(300)));
        let indexer = indexer(embedding.clone(), storage.clone(), 10);
        let locations = ContainerLocations::single(loc(0));

        indexer.schedule_index(locations.clone(), items(&["old"]));
        sleep(Duration::from_millis(100));
        indexer.schedule_index(locations, items(&["new"]));
        sleep(Duration::from_millis(1000));

        assert_eq!(embedding.calls.load(Ordering::SeqCst), 2);
        assert_eq!(storage.write_count(), 1);
        assert_eq!(storage.last_write()[0].text, "new");
        indexer.shutdown();
    }

    #[test]
    fn test_shutdown_cancels_pending_and_is_idempotent() {
        let storage = Arc::new(RecordingStorage::new());
        let indexer = indexer(Arc::new(KeywordEmbedder), storage.clone(), 10_000);

        indexer.schedule_index(ContainerLocations::single(loc(0)), items(&["stone"]));
        indexer.shutdown();
        indexer.shutdown();
        assert!(indexer.is_shut_down());
        assert!(indexer.runtime_handle().is_none());
        assert_eq!(storage.write_count(), 0);

        indexer.schedule_index(ContainerLocations::single(loc(1)), items(&["dirt"]));
        indexer.remove_container(loc(1));
        assert_eq!(indexer.pending_count(), 0);
    }

    #[test]
    fn test_shutdown_waits_for_running_work() {
        let storage = Arc::new(RecordingStorage::new());
        let embedding = Arc::new(SlowEmbedder::new(Duration::from_millis(300)));
        let indexer = indexer(embedding, storage.clone(), 10);

        indexer.schedule_index(ContainerLocations::single(loc(0)), items(&["stone"]));
        sleep(Duration::from_millis(100));
        indexer.shutdown();
        assert_eq!(storage.write_count(), 1);
    }

    #[test]
    fn test_remove_container_resolves_primary() {
        let storage = Arc::new(RecordingStorage::new());
        let indexer = indexer(Arc::new(KeywordEmbedder), storage.clone(), 20);
        let double = ContainerLocations::new(loc(0), [loc(1)]);

        indexer.schedule_index(double, items(&["stone"]));
        sleep(Duration::from_millis(300));
        indexer.remove_container(loc(1));
        sleep(Duration::from_millis(300));

        assert_eq!(storage.deleted(), vec![loc(0)]);
        assert_eq!(storage.stored_chunks(), 0);
        indexer.shutdown();
    }
}
