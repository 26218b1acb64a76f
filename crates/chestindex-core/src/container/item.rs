//! Item capability consumed by the serializer
//!
//! Game adapters implement [`Item`] over their native stack type. [`ItemStack`]
//! is a plain-data implementation for adapters that copy state out eagerly.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enchantment {
    pub id: String,
    pub level: u32,
}

impl Enchantment {
    pub fn new(id: impl Into<String>, level: u32) -> Self {
        Self {
            id: id.into(),
            level,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Durability {
    pub damage: u32,
    pub max: u32,
}

/// An occupied slot
#[derive(Clone)]
pub struct SlotItem {
    pub slot: u32,
    pub item: Arc<dyn Item>,
}

impl SlotItem {
    pub fn new(slot: u32, item: Arc<dyn Item>) -> Self {
        Self { slot, item }
    }

    /// Map a raw slot array (with empty slots) to the occupied slots, keeping
    /// each item's index as its slot number.
    pub fn from_slots<I>(slots: I) -> Vec<SlotItem>
    where
        I: IntoIterator<Item = Option<Arc<dyn Item>>>,
    {
        slots
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| {
                let item = item?;
                let slot = u32::try_from(index).ok()?;
                Some(SlotItem { slot, item })
            })
            .collect()
    }
}

impl fmt::Debug for SlotItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotItem")
            .field("slot", &self.slot)
            .field("material", &self.item.material())
            .field("amount", &self.item.amount())
            .finish()
    }
}

/// Contents of an item that is itself a container (shulker box, bundle)
#[derive(Debug, Clone)]
pub struct NestedContainer {
    pub container_type: String,
    pub color: Option<String>,
    pub custom_name: Option<String>,
    pub contents: Vec<SlotItem>,
}

impl NestedContainer {
    pub fn new(container_type: impl Into<String>, contents: Vec<SlotItem>) -> Self {
        Self {
            container_type: container_type.into(),
            color: None,
            custom_name: None,
            contents,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn with_custom_name(mut self, name: impl Into<String>) -> Self {
        self.custom_name = Some(name.into());
        self
    }
}

/// Read-only view of one item stack
pub trait Item: Send + Sync {
    /// Material identifier, e.g. `DIAMOND_SWORD` or `minecraft:diamond_sword`
    fn material(&self) -> &str;

    fn amount(&self) -> u32;

    /// Custom display name, if the item was renamed
    fn display_name(&self) -> Option<&str> {
        None
    }

    fn lore(&self) -> Vec<String> {
        Vec::new()
    }

    fn enchantments(&self) -> Vec<Enchantment> {
        Vec::new()
    }

    fn durability(&self) -> Option<Durability> {
        None
    }

    /// Contents, when the item is itself a container
    fn container(&self) -> Option<NestedContainer> {
        None
    }
}

/// Owned item state
#[derive(Debug, Clone, Default)]
pub struct ItemStack {
    pub material: String,
    pub amount: u32,
    pub display_name: Option<String>,
    pub lore: Vec<String>,
    pub enchantments: Vec<Enchantment>,
    pub durability: Option<Durability>,
    pub container: Option<NestedContainer>,
}

impl ItemStack {
    pub fn new(material: impl Into<String>, amount: u32) -> Self {
        Self {
            material: material.into(),
            amount,
            ..Default::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_lore(mut self, line: impl Into<String>) -> Self {
        self.lore.push(line.into());
        self
    }

    pub fn with_enchantment(mut self, id: impl Into<String>, level: u32) -> Self {
        self.enchantments.push(Enchantment::new(id, level));
        self
    }

    pub fn with_durability(mut self, damage: u32, max: u32) -> Self {
        self.durability = Some(Durability { damage, max });
        self
    }

    pub fn with_contents(mut self, container: NestedContainer) -> Self {
        self.container = Some(container);
        self
    }

    pub fn into_slot(self, slot: u32) -> SlotItem {
        SlotItem::new(slot, Arc::new(self))
    }
}

impl Item for ItemStack {
    fn material(&self) -> &str {
        &self.material
    }

    fn amount(&self) -> u32 {
        self.amount
    }

    fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    fn lore(&self) -> Vec<String> {
        self.lore.clone()
    }

    fn enchantments(&self) -> Vec<Enchantment> {
        self.enchantments.clone()
    }

    fn durability(&self) -> Option<Durability> {
        self.durability
    }

    fn container(&self) -> Option<NestedContainer> {
        self.container.clone()
    }
}
