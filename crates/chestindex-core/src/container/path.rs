//! Nesting chain of containers an item sits in
//!
//! Two JSON encodings are understood:
//!
//! - the current one, an array of node objects
//!   (`[{"type":"shulker_box","color":"red","slot":12}]`)
//! - the legacy one, an array of plain container names (`["Red Shulker Box"]`)
//!
//! Decoding accepts both (and mixtures of both) without the caller choosing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChestError, ChestResult};

/// Container type used when a node does not say what it is
pub const DEFAULT_CONTAINER_TYPE: &str = "container";

fn default_container_type() -> String {
    DEFAULT_CONTAINER_TYPE.to_string()
}

/// One level of nesting
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerNode {
    #[serde(rename = "type", default = "default_container_type")]
    pub container_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(rename = "customName", default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    /// Slot index inside the parent container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u32>,
}

impl ContainerNode {
    pub fn new(container_type: impl Into<String>) -> Self {
        let container_type = container_type.into();
        Self {
            container_type: if container_type.trim().is_empty() {
                default_container_type()
            } else {
                container_type
            },
            color: None,
            custom_name: None,
            slot: None,
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

    pub fn with_slot(mut self, slot: u32) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Human-readable name: the custom name if set, otherwise color + type.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.custom_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }

        let kind = match self.container_type.to_lowercase().as_str() {
            "shulker_box" | "shulker" => "Shulker Box".to_string(),
            other => title_case(other),
        };

        match self.color.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(color) => format!("{} {}", title_case(color), kind),
            None => kind,
        }
    }

    fn from_value(value: &Value) -> Self {
        match value {
            Value::String(name) => Self::new(DEFAULT_CONTAINER_TYPE).with_custom_name(name.clone()),
            Value::Object(fields) => {
                // Present values are kept as written, empty strings included
                let text = |key: &str| fields.get(key).and_then(Value::as_str).map(str::to_string);
                Self {
                    container_type: text("type").unwrap_or_else(default_container_type),
                    color: text("color"),
                    custom_name: text("customName").or_else(|| text("name")),
                    slot: fields
                        .get("slot")
                        .and_then(Value::as_u64)
                        .and_then(|s| u32::try_from(s).ok()),
                }
            }
            _ => Self::new(DEFAULT_CONTAINER_TYPE),
        }
    }
}

/// Ordered chain of containers, outermost first. Depth 0 is [`ContainerPath::ROOT`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ContainerPath {
    nodes: Vec<ContainerNode>,
}

impl ContainerPath {
    /// Not inside any container
    pub const ROOT: ContainerPath = ContainerPath { nodes: Vec::new() };

    /// Return a new path with `node` appended as the innermost level.
    pub fn push(&self, node: ContainerNode) -> ContainerPath {
        let mut nodes = Vec::with_capacity(self.nodes.len() + 1);
        nodes.extend(self.nodes.iter().cloned());
        nodes.push(node);
        ContainerPath { nodes }
    }

    pub fn depth(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_root(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[ContainerNode] {
        &self.nodes
    }

    pub fn innermost(&self) -> Option<&ContainerNode> {
        self.nodes.last()
    }

    /// Breadcrumb such as `in Red Shulker Box (slot 12) in Bundle (slot 5)`.
    /// Empty for the root path.
    pub fn to_display_string(&self) -> String {
        self.nodes
            .iter()
            .map(|node| match node.slot {
                Some(slot) => format!("in {} (slot {})", node.display_name(), slot),
                None => format!("in {}", node.display_name()),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.nodes).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(&self.nodes).unwrap_or_else(|_| Value::Array(Vec::new()))
    }

    /// Decode either encoding. Empty input and `[]` are the root path; anything
    /// that is not a JSON array is a [`ChestError::MalformedPath`].
    pub fn from_json(text: &str) -> ChestResult<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::ROOT);
        }

        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| ChestError::MalformedPath(format!("invalid JSON: {}", e)))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> ChestResult<Self> {
        match value {
            Value::Array(items) => Ok(Self {
                nodes: items.iter().map(ContainerNode::from_value).collect(),
            }),
            Value::Null => Ok(Self::ROOT),
            other => Err(ChestError::MalformedPath(format!(
                "expected a JSON array, got {}",
                json_kind(other)
            ))),
        }
    }
}

impl From<Vec<ContainerNode>> for ContainerPath {
    fn from(nodes: Vec<ContainerNode>) -> Self {
        Self { nodes }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// `"light_blue"` -> `"Light Blue"`, `"minecraft:diamond_pickaxe"` -> `"Diamond Pickaxe"`
pub(crate) fn title_case(token: &str) -> String {
    let token = token.rsplit(':').next().unwrap_or(token);
    token
        .split(|c: char| c == '_' || c.is_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
