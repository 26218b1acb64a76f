//! Container data model: positions, nesting paths, items, tags and serialization

mod item;
mod location;
mod path;
mod serializer;
mod tags;

pub use item::{Durability, Enchantment, Item, ItemStack, NestedContainer, SlotItem};
pub use location::{resolve_double_chest_locations, ContainerLocations, LocationData};
pub use path::{ContainerNode, ContainerPath, DEFAULT_CONTAINER_TYPE};
pub use serializer::{
    embedding_text, ContainerTree, ItemSerializer, SerializedItem, TreeEntry, MAX_NESTING_DEPTH,
};
pub use tags::{
    EnchantedTags, MaterialCategoryTags, TagError, TagOutcome, TagProvider, TagProviderRegistry,
};
