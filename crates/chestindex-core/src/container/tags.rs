//! Pluggable semantic tag providers
//!
//! Providers run in registration order against every item. A failing provider
//! (error or panic) only loses its own tags for that item.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use super::item::Item;

#[derive(Debug, Error)]
pub enum TagError {
    #[error("{0}")]
    Failed(String),
    #[error("tag provider panicked")]
    Panicked,
}

/// Contributes tags for items it knows about
pub trait TagProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Tags for `item`, without the `#` prefix. Return an empty list to abstain.
    fn tags(&self, item: &dyn Item) -> Result<Vec<String>, TagError>;
}

/// Outcome of one provider for one item
#[derive(Debug)]
pub struct TagOutcome {
    pub provider: String,
    pub result: Result<Vec<String>, TagError>,
}

/// Registry of tag providers.
///
/// The provider list is copy-on-write: collection clones the current `Arc`
/// snapshot and iterates it without holding the lock, so registration never
/// blocks a running collection and readers never block each other.
#[derive(Default)]
pub struct TagProviderRegistry {
    providers: RwLock<Arc<Vec<Arc<dyn TagProvider>>>>,
}

impl TagProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in material and enchantment providers
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(MaterialCategoryTags));
        registry.register(Arc::new(EnchantedTags));
        registry
    }

    pub fn register(&self, provider: Arc<dyn TagProvider>) {
        let mut guard = self.providers.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(provider);
        *guard = Arc::new(next);
    }

    /// Remove a provider by identity. Returns whether it was registered.
    pub fn unregister(&self, provider: &Arc<dyn TagProvider>) -> bool {
        let mut guard = self.providers.write();
        let before = guard.len();
        let next: Vec<_> = guard
            .iter()
            .filter(|p| !Arc::ptr_eq(p, provider))
            .cloned()
            .collect();
        let removed = next.len() != before;
        *guard = Arc::new(next);
        removed
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<Vec<Arc<dyn TagProvider>>> {
        self.providers.read().clone()
    }

    /// Run every provider and report each outcome, in registration order.
    pub fn collect_outcomes(&self, item: &dyn Item) -> Vec<TagOutcome> {
        self.snapshot()
            .iter()
            .map(|provider| {
                let result = catch_unwind(AssertUnwindSafe(|| provider.tags(item)))
                    .unwrap_or(Err(TagError::Panicked));
                TagOutcome {
                    provider: provider.name().to_string(),
                    result,
                }
            })
            .collect()
    }

    /// Union of all tags from providers that succeeded
    pub fn collect_tags(&self, item: &dyn Item) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        for outcome in self.collect_outcomes(item) {
            match outcome.result {
                Ok(found) => tags.extend(
                    found
                        .into_iter()
                        .map(|t| t.trim().trim_start_matches('#').to_string())
                        .filter(|t| !t.is_empty()),
                ),
                Err(e) => log::debug!(
                    "[Tags] Provider '{}' skipped for {}: {}",
                    outcome.provider,
                    item.material(),
                    e
                ),
            }
        }
        tags
    }
}

fn material_key(item: &dyn Item) -> String {
    let material = item.material();
    material
        .rsplit(':')
        .next()
        .unwrap_or(material)
        .to_lowercase()
}

/// Tags an item by what its material is: weapon, tool, armor, container, food
pub struct MaterialCategoryTags;

const WEAPON_SUFFIXES: &[&str] = &["_sword", "_axe"];
const WEAPONS: &[&str] = &["bow", "crossbow", "trident", "mace"];
const TOOL_SUFFIXES: &[&str] = &["_pickaxe", "_shovel", "_hoe", "_axe"];
const TOOLS: &[&str] = &["shears", "fishing_rod", "flint_and_steel", "brush"];
const ARMOR_SUFFIXES: &[&str] = &["_helmet", "_chestplate", "_leggings", "_boots"];
const ARMOR: &[&str] = &["shield", "elytra", "turtle_helmet"];
const CONTAINER_SUFFIXES: &[&str] = &["shulker_box", "bundle"];
const CONTAINERS: &[&str] = &["chest", "barrel", "trapped_chest", "ender_chest"];
const FOOD: &[&str] = &[
    "apple",
    "golden_apple",
    "bread",
    "carrot",
    "golden_carrot",
    "potato",
    "baked_potato",
    "beef",
    "cooked_beef",
    "porkchop",
    "cooked_porkchop",
    "chicken",
    "cooked_chicken",
    "mutton",
    "cooked_mutton",
    "cod",
    "cooked_cod",
    "salmon",
    "cooked_salmon",
    "cookie",
    "melon_slice",
    "pumpkin_pie",
    "sweet_berries",
    "glow_berries",
    "mushroom_stew",
    "beetroot",
    "beetroot_soup",
    "dried_kelp",
];

impl TagProvider for MaterialCategoryTags {
    fn name(&self) -> &str {
        "material-category"
    }

    fn tags(&self, item: &dyn Item) -> Result<Vec<String>, TagError> {
        let key = material_key(item);
        let matches = |suffixes: &[&str], names: &[&str]| {
            names.contains(&key.as_str()) || suffixes.iter().any(|s| key.ends_with(s))
        };

        let mut tags = Vec::new();
        if matches(WEAPON_SUFFIXES, WEAPONS) {
            tags.push("weapon".to_string());
        }
        if matches(TOOL_SUFFIXES, TOOLS) {
            tags.push("tool".to_string());
        }
        if matches(ARMOR_SUFFIXES, ARMOR) {
            tags.push("armor".to_string());
        }
        if matches(CONTAINER_SUFFIXES, CONTAINERS) {
            tags.push("container".to_string());
        }
        if FOOD.contains(&key.as_str()) {
            tags.push("food".to_string());
        }
        Ok(tags)
    }
}

/// Tags items that carry enchantments
pub struct EnchantedTags;

impl TagProvider for EnchantedTags {
    fn name(&self) -> &str {
        "enchanted"
    }

    fn tags(&self, item: &dyn Item) -> Result<Vec<String>, TagError> {
        if item.enchantments().is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec!["enchanted".to_string()])
        }
    }
}
