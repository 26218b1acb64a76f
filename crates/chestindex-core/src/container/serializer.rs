//! Item and container serialization
//!
//! Every item becomes a [`SerializedItem`]: a lower-cased embedding text plus a
//! storage JSON object used for display and keyword scoring. Items that are
//! themselves containers are recursed into, with their contents carrying a
//! [`ContainerPath`] that records the nesting.

use std::sync::Arc;

use serde::Serialize;

use super::item::{Durability, Enchantment, Item, SlotItem};
use super::path::{title_case, ContainerNode, ContainerPath};
use super::tags::TagProviderRegistry;

/// Nesting below this depth is not descended into
pub const MAX_NESTING_DEPTH: usize = 8;

/// One serialized item
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedItem {
    /// Normalized (lower-case) text sent to the embedding model
    pub embedding_text: String,
    /// Structured item description persisted next to the vector
    pub storage_json: String,
    /// Containers this item sits in, relative to the indexed block
    pub container_path: ContainerPath,
}

/// Serialized contents of one container level
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerTree {
    /// `None` for the block container itself
    pub node: Option<ContainerNode>,
    pub path: ContainerPath,
    pub entries: Vec<TreeEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeEntry {
    pub slot: u32,
    pub item: SerializedItem,
    /// Present when the item is itself a container
    pub contents: Option<ContainerTree>,
}

impl ContainerTree {
    /// Every item in the tree, depth-first in slot order (the order `serialize` uses)
    pub fn leaves(&self) -> Vec<&SerializedItem> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a SerializedItem>) {
        for entry in &self.entries {
            out.push(&entry.item);
            if let Some(ref contents) = entry.contents {
                contents.collect_leaves(out);
            }
        }
    }

    pub fn item_count(&self) -> usize {
        self.leaves().len()
    }
}

#[derive(Debug, Serialize)]
struct StoredItem<'a> {
    display_name: String,
    material: &'a str,
    amount: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    enchantments: Vec<Enchantment>,
    tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    lore: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    durability: Option<Durability>,
    slot: u32,
    container_path: serde_json::Value,
    #[serde(skip_serializing_if = "String::is_empty")]
    location_hint: String,
}

/// Turns item collections into serialized items, using the tag registry it was built with
#[derive(Clone)]
pub struct ItemSerializer {
    registry: Arc<TagProviderRegistry>,
}

impl ItemSerializer {
    pub fn new(registry: Arc<TagProviderRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TagProviderRegistry> {
        &self.registry
    }

    /// Flat, order-preserving serialization. A container item is followed by its contents.
    pub fn serialize(&self, items: &[SlotItem]) -> Vec<SerializedItem> {
        self.serialize_tree(items)
            .leaves()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Hierarchical serialization rooted at the block container
    pub fn serialize_tree(&self, items: &[SlotItem]) -> ContainerTree {
        self.build_tree(None, ContainerPath::ROOT, items)
    }

    fn build_tree(
        &self,
        node: Option<ContainerNode>,
        path: ContainerPath,
        items: &[SlotItem],
    ) -> ContainerTree {
        let mut sorted: Vec<&SlotItem> = items.iter().collect();
        sorted.sort_by_key(|s| s.slot);

        let entries = sorted
            .into_iter()
            .map(|slot_item| {
                let item = slot_item.item.as_ref();
                let serialized = self.serialize_item(item, slot_item.slot, &path);

                let contents = item.container().and_then(|nested| {
                    if path.depth() >= MAX_NESTING_DEPTH {
                        log::debug!(
                            "[Serializer] Not descending into {} at depth {}",
                            item.material(),
                            path.depth()
                        );
                        return None;
                    }
                    let mut child = ContainerNode::new(nested.container_type.clone())
                        .with_slot(slot_item.slot);
                    child.color = nested.color.clone();
                    child.custom_name = nested.custom_name.clone();
                    let child_path = path.push(child.clone());
                    Some(self.build_tree(Some(child), child_path, &nested.contents))
                });

                TreeEntry {
                    slot: slot_item.slot,
                    item: serialized,
                    contents,
                }
            })
            .collect();

        ContainerTree {
            node,
            path,
            entries,
        }
    }

    fn serialize_item(&self, item: &dyn Item, slot: u32, path: &ContainerPath) -> SerializedItem {
        let tags: Vec<String> = self.registry.collect_tags(item).into_iter().collect();
        let embedding_text = embedding_text(item.material(), &tags);

        let stored = StoredItem {
            display_name: item
                .display_name()
                .filter(|n| !n.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| title_case(item.material())),
            material: item.material(),
            amount: item.amount(),
            enchantments: item.enchantments(),
            tags,
            lore: item.lore(),
            durability: item.durability(),
            slot,
            container_path: path.to_value(),
            location_hint: path.to_display_string(),
        };

        let storage_json = serde_json::to_string(&stored).unwrap_or_else(|e| {
            log::warn!("[Serializer] Failed to encode {}: {}", item.material(), e);
            "{}".to_string()
        });

        SerializedItem {
            embedding_text,
            storage_json,
            container_path: path.clone(),
        }
    }
}

/// `"DIAMOND_SWORD"` + `["weapon"]` -> `"diamond sword #weapon"`
pub fn embedding_text(material: &str, tags: &[String]) -> String {
    let mut text = title_case(material);
    for tag in tags {
        if !text.is_empty() {
            text.push(' ');
        }
        text.push('#');
        text.push_str(tag);
    }
    text.to_lowercase()
}
