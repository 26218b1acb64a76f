//! Index synchronization service
//!
//! Listens to container events and forwards them to the indexer, which does
//! its own per-container debouncing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::indexer::ContainerIndexer;
use crate::container::ItemSerializer;
use crate::events::{ContainerEvent, SharedEventBus};

pub struct EventSyncService {
    indexer: Arc<ContainerIndexer>,
    serializer: ItemSerializer,
    enabled: AtomicBool,
}

impl EventSyncService {
    pub fn new(indexer: Arc<ContainerIndexer>, serializer: ItemSerializer) -> Self {
        Self {
            indexer,
            serializer,
            enabled: AtomicBool::new(true),
        }
    }

    /// Enable or disable the service. Events received while disabled are dropped.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Subscribe now and process events on `runtime` until the bus closes
    pub fn spawn(self: Arc<Self>, event_bus: &SharedEventBus, runtime: &Handle) -> JoinHandle<()> {
        let receiver = event_bus.subscribe();
        runtime.spawn(async move { self.run(receiver).await })
    }

    async fn run(&self, mut receiver: broadcast::Receiver<ContainerEvent>) {
        log::info!("[EventSync] Started");
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if self.is_enabled() {
                        self.handle_event(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("[EventSync] Lagged behind by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    log::info!("[EventSync] Event bus closed, stopping sync service");
                    break;
                }
            }
        }
    }

    pub fn handle_event(&self, event: ContainerEvent) {
        match event {
            ContainerEvent::Changed { locations, items } => {
                let serialized = self.serializer.serialize(&items);
                log::debug!(
                    "[EventSync] {} changed ({} items)",
                    locations.primary_location(),
                    serialized.len()
                );
                self.indexer.schedule_index(locations, serialized);
            }
            ContainerEvent::Destroyed { location } => {
                log::debug!("[EventSync] {} destroyed", location);
                self.indexer.remove_container(location);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;
    use std::time::Duration;

    use super::*;
    use crate::container::{ContainerLocations, ItemStack, LocationData, TagProviderRegistry};
    use crate::events::EventBus;
    use crate::search::config::IndexerConfig;
    use crate::search::testing::{KeywordEmbedder, RecordingStorage};

    fn setup() -> (Arc<EventSyncService>, Arc<ContainerIndexer>, Arc<RecordingStorage>) {
        let storage = Arc::new(RecordingStorage::new());
        let config = IndexerConfig {
            debounce_ms: 20,
            ..Default::default()
        };
        let indexer =
            Arc::new(ContainerIndexer::new(Arc::new(KeywordEmbedder), storage.clone(), &config).unwrap());
        let serializer = ItemSerializer::new(Arc::new(TagProviderRegistry::with_defaults()));
        let service = Arc::new(EventSyncService::new(indexer.clone(), serializer));
        (service, indexer, storage)
    }

    fn loc(x: i32) -> LocationData {
        LocationData::new("overworld", x, 64, 0).unwrap()
    }

    #[test]
    fn test_events_reach_the_index() {
        let (service, indexer, storage) = setup();
        let bus = EventBus::shared();
        let handle = indexer.runtime_handle().unwrap();
        let task = service.clone().spawn(&bus, &handle);

        bus.emit_changed(
            ContainerLocations::single(loc(0)),
            vec![ItemStack::new("DIAMOND_SWORD", 1).into_slot(0)],
        );
        sleep(Duration::from_millis(300));
        assert_eq!(storage.last_write()[0].text, "diamond sword #weapon");

        bus.emit_destroyed(loc(0));
        sleep(Duration::from_millis(300));
        assert_eq!(storage.deleted(), vec![loc(0)]);

        drop(bus);
        sleep(Duration::from_millis(100));
        assert!(task.is_finished());
        indexer.shutdown();
    }

    #[test]
    fn test_disabled_service_drops_events() {
        let (service, indexer, storage) = setup();
        service.set_enabled(false);
        let bus = EventBus::shared();
        let handle = indexer.runtime_handle().unwrap();
        let _task = service.clone().spawn(&bus, &handle);

        bus.emit_changed(
            ContainerLocations::single(loc(0)),
            vec![ItemStack::new("STONE", 64).into_slot(0)],
        );
        sleep(Duration::from_millis(200));
        assert_eq!(storage.write_count(), 0);
        assert_eq!(storage.registration_count(), 0);
        indexer.shutdown();
    }

    #[test]
    fn test_changed_to_empty_deletes() {
        let (service, indexer, storage) = setup();
        service.handle_event(ContainerEvent::Changed {
            locations: ContainerLocations::single(loc(2)),
            items: vec![],
        });
        sleep(Duration::from_millis(200));
        assert_eq!(storage.deleted(), vec![loc(2)]);
        indexer.shutdown();
    }
}
