//! Container events published by game adapters

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::container::{ContainerLocations, LocationData, SlotItem};

const DEFAULT_CAPACITY: usize = 1024;

/// Something happened to a container in the world
#[derive(Debug, Clone)]
pub enum ContainerEvent {
    /// Contents changed; `items` is the full new contents
    Changed {
        locations: ContainerLocations,
        items: Vec<SlotItem>,
    },
    /// A block of the container was broken
    Destroyed { location: LocationData },
}

/// Broadcast channel for [`ContainerEvent`]s
pub struct EventBus {
    sender: broadcast::Sender<ContainerEvent>,
}

pub type SharedEventBus = Arc<EventBus>;

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn shared() -> SharedEventBus {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ContainerEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn emit_changed(&self, locations: ContainerLocations, items: Vec<SlotItem>) {
        self.emit(ContainerEvent::Changed { locations, items });
    }

    pub fn emit_destroyed(&self, location: LocationData) {
        self.emit(ContainerEvent::Destroyed { location });
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
