//! Common types for search module

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::container::LocationData;

/// What an embedding will be used for. Asymmetric models embed stored
/// documents and search queries differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingTask {
    Document,
    Query,
}

/// One embeddable unit of a container's contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerChunk {
    /// Primary location of the container
    pub location: LocationData,
    /// Index of this chunk within the container
    pub chunk_index: u32,
    /// Normalized (lower-case) text that was embedded
    pub text: String,
    /// JSON array of the stored item objects in this chunk
    pub content: String,
    /// Embedding vector
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub vector: Vec<f32>,
    /// Index time, ms since epoch
    pub indexed_at: i64,
}

/// A single search result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Primary location of the matched container
    pub location: LocationData,
    /// Every block of the matched container
    pub all_locations: BTreeSet<LocationData>,
    pub chunk_index: u32,
    /// Relevance score (0-1)
    pub score: f32,
    /// Short text shown in result lists
    pub preview: String,
    /// Full stored content, when the backend returned it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl SearchHit {
    pub fn new(location: LocationData, score: f32, preview: impl Into<String>) -> Self {
        let mut all_locations = BTreeSet::new();
        all_locations.insert(location.clone());
        Self {
            location,
            all_locations,
            chunk_index: 0,
            score: clamp_score(score),
            preview: preview.into(),
            content: None,
        }
    }

    /// Replace the block set; the primary location is always kept in it.
    pub fn with_all_locations(mut self, locations: impl IntoIterator<Item = LocationData>) -> Self {
        self.all_locations = locations.into_iter().collect();
        self.all_locations.insert(self.location.clone());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_chunk_index(mut self, chunk_index: u32) -> Self {
        self.chunk_index = chunk_index;
        self
    }

    pub fn set_score(&mut self, score: f32) {
        self.score = clamp_score(score);
    }

    /// Content used for keyword scoring: the full content, or the preview when absent
    pub fn scoring_text(&self) -> &str {
        self.content.as_deref().unwrap_or(&self.preview)
    }
}

fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Restricts which containers a storage search may return
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    /// Only containers in this world
    pub world: Option<String>,
    /// Only containers within `radius` blocks of a location
    pub near: Option<(LocationData, u32)>,
}

impl SearchFilter {
    pub fn world(world: impl Into<String>) -> Self {
        Self {
            world: Some(world.into()),
            near: None,
        }
    }

    pub fn near(center: LocationData, radius: u32) -> Self {
        Self {
            world: Some(center.world().to_string()),
            near: Some((center, radius)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.world.is_none() && self.near.is_none()
    }

    pub fn matches(&self, location: &LocationData) -> bool {
        if let Some(ref world) = self.world {
            if location.world() != world {
                return false;
            }
        }
        if let Some((ref center, radius)) = self.near {
            let radius = i128::from(radius);
            match center.distance_squared(location) {
                Some(d) if d <= radius * radius => {}
                _ => return false,
            }
        }
        true
    }
}

/// Milliseconds since epoch
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
