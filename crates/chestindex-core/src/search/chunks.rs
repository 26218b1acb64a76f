//! Grouping serialized items into embeddable chunks
//!
//! Items of the same container level stay together, so a shulker box inside a
//! chest becomes its own chunk. A group is split when its joined text would
//! exceed the configured size. Sizes are counted in characters, not bytes.

use serde_json::Value;

use crate::container::{ContainerPath, SerializedItem};

/// Text and content of one chunk, before it is embedded
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChunk {
    pub chunk_index: u32,
    /// Newline-joined embedding texts
    pub text: String,
    /// JSON array of the items' storage objects
    pub content: String,
    pub container_path: ContainerPath,
}

pub struct ChunkBuilder {
    max_chunk_chars: usize,
}

impl Default for ChunkBuilder {
    fn default() -> Self {
        Self {
            max_chunk_chars: 2000,
        }
    }
}

impl ChunkBuilder {
    pub fn new(max_chunk_chars: usize) -> Self {
        Self {
            max_chunk_chars: max_chunk_chars.max(1),
        }
    }

    pub fn build(&self, items: &[SerializedItem]) -> Vec<PendingChunk> {
        let mut groups: Vec<(&ContainerPath, Vec<&SerializedItem>)> = Vec::new();
        for item in items {
            match groups.iter_mut().find(|(path, _)| **path == item.container_path) {
                Some((_, members)) => members.push(item),
                None => groups.push((&item.container_path, vec![item])),
            }
        }

        let mut chunks = Vec::new();
        for (path, members) in groups {
            let mut batch: Vec<&SerializedItem> = Vec::new();
            let mut batch_chars = 0;
            for item in members {
                let item_chars = item.embedding_text.chars().count();
                // +1 for the joining newline
                let joined = if batch.is_empty() {
                    item_chars
                } else {
                    batch_chars + 1 + item_chars
                };
                if !batch.is_empty() && joined > self.max_chunk_chars {
                    chunks.push(Self::finish(chunks.len(), path, &batch));
                    batch.clear();
                    batch_chars = item_chars;
                } else {
                    batch_chars = joined;
                }
                batch.push(item);
            }
            if !batch.is_empty() {
                chunks.push(Self::finish(chunks.len(), path, &batch));
            }
        }
        chunks
    }

    fn finish(index: usize, path: &ContainerPath, items: &[&SerializedItem]) -> PendingChunk {
        let text = items
            .iter()
            .map(|i| i.embedding_text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let content = Value::Array(
            items
                .iter()
                .map(|i| {
                    serde_json::from_str(&i.storage_json)
                        .unwrap_or_else(|_| Value::String(i.storage_json.clone()))
                })
                .collect(),
        );

        PendingChunk {
            chunk_index: index as u32,
            text,
            content: content.to_string(),
            container_path: path.clone(),
        }
    }
}
