//! Semantic search over the contents of in-game storage containers.
//!
//! Game adapters report container changes; the index serializes the items,
//! embeds them in the background after a quiet period and answers natural
//! language queries with the locations of matching containers.


pub mod container;
pub mod error;
pub mod events;
pub mod search;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Builder;
use tokio::task::JoinHandle;

pub use container::{
    ContainerLocations, ContainerPath, Item, ItemSerializer, ItemStack, LocationData,
    NestedContainer, SerializedItem, SlotItem, TagProviderRegistry,
};
pub use error::{ChestError, ChestResult};
pub use events::{ContainerEvent, EventBus, SharedEventBus};
use search::{
    create_embedding_service, create_vector_storage, ChestIndexConfig, ContainerIndexer,
    EventSyncService, SearchFilter, SearchHit, Searcher, VectorStorage,
};

/// Container index: serializer, background indexer and searcher sharing one
/// worker pool.
pub struct ChestIndex {
    registry: Arc<TagProviderRegistry>,
    serializer: ItemSerializer,
    storage: Arc<dyn VectorStorage>,
    indexer: Arc<ContainerIndexer>,
    searcher: Searcher,
    event_bus: SharedEventBus,
    event_sync: Mutex<Option<JoinHandle<()>>>,
}

impl ChestIndex {
    /// Open with `config.toml` from the config dir plus environment overrides
    pub fn open_default() -> ChestResult<Self> {
        Self::open(ChestIndexConfig::load()?)
    }

    /// Build every component. Must be called outside an async runtime.
    pub fn open(config: ChestIndexConfig) -> ChestResult<Self> {
        config.validate()?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(config.indexer.worker_threads())
            .thread_name("chestindex-worker")
            .enable_all()
            .build()?;

        let storage = runtime.block_on(create_vector_storage(&config.storage))?;
        let embedding = create_embedding_service(&config.embedding);

        let registry = Arc::new(TagProviderRegistry::with_defaults());
        let serializer = ItemSerializer::new(registry.clone());
        let searcher = Searcher::new(embedding.clone(), storage.clone(), &config.search);
        let indexer = Arc::new(ContainerIndexer::with_runtime(
            runtime,
            embedding,
            storage.clone(),
            &config.indexer,
        ));

        Ok(Self {
            registry,
            serializer,
            storage,
            indexer,
            searcher,
            event_bus: EventBus::shared(),
            event_sync: Mutex::new(None),
        })
    }

    /// A container's contents changed. `items` is the full new contents;
    /// an empty slice removes the container from the index.
    pub fn container_changed(&self, locations: ContainerLocations, items: &[SlotItem]) {
        let serialized = self.serializer.serialize(items);
        self.indexer.schedule_index(locations, serialized);
    }

    /// A block of a container was broken
    pub fn container_destroyed(&self, location: LocationData) {
        self.indexer.remove_container(location);
    }

    /// Schedule already serialized items
    pub fn schedule_index(&self, locations: ContainerLocations, items: Vec<SerializedItem>) {
        self.indexer.schedule_index(locations, items);
    }

    pub async fn search(&self, query: &str, limit: usize) -> ChestResult<Vec<SearchHit>> {
        self.searcher.search(query, limit).await
    }

    /// Search with the configured `search.default_limit`
    pub async fn search_default(&self, query: &str) -> ChestResult<Vec<SearchHit>> {
        self.searcher.search_default(query).await
    }

    pub async fn search_with_filter(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> ChestResult<Vec<SearchHit>> {
        self.searcher.search_with_filter(query, limit, filter).await
    }

    /// Search from a plain thread, on the index's own worker pool
    pub fn search_blocking(&self, query: &str, limit: usize) -> ChestResult<Vec<SearchHit>> {
        let handle = self.indexer.runtime_handle().ok_or(ChestError::ShutDown)?;
        handle.block_on(self.searcher.search(query, limit))
    }

    /// Number of stored chunks
    pub fn chunk_count(&self) -> ChestResult<usize> {
        let handle = self.indexer.runtime_handle().ok_or(ChestError::ShutDown)?;
        handle.block_on(self.storage.count())
    }

    pub fn serializer(&self) -> &ItemSerializer {
        &self.serializer
    }

    pub fn tag_registry(&self) -> &Arc<TagProviderRegistry> {
        &self.registry
    }

    pub fn event_bus(&self) -> &SharedEventBus {
        &self.event_bus
    }

    pub fn indexer(&self) -> &Arc<ContainerIndexer> {
        &self.indexer
    }

    /// Index containers from events published on [`ChestIndex::event_bus`].
    /// Calling it again while the listener runs does nothing.
    pub fn start_event_sync(&self) -> ChestResult<()> {
        let mut event_sync = self.event_sync.lock();
        if event_sync.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }
        let handle = self.indexer.runtime_handle().ok_or(ChestError::ShutDown)?;
        let service = Arc::new(EventSyncService::new(
            self.indexer.clone(),
            self.serializer.clone(),
        ));
        *event_sync = Some(service.spawn(&self.event_bus, &handle));
        Ok(())
    }

    /// Stop listening for events, cancel pending work and wait (bounded by
    /// the configured grace period) for running work. Idempotent.
    pub fn shutdown(&self) {
        if let Some(task) = self.event_sync.lock().take() {
            task.abort();
        }
        self.indexer.shutdown();
    }
}

impl Drop for ChestIndex {
    fn drop(&mut self) {
        if let Some(task) = self.event_sync.lock().take() {
            task.abort();
        }
    }
}
