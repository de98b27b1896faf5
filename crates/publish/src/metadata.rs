//! Release and build metadata documents and the content references they upload to.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

/// Which metadata document a payload or reference belongs to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MetadataKind {
    Release,
    Build,
}

/// A JSON metadata document referenced on-chain by its content identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub kind: MetadataKind,
    pub content: Value,
}

impl MetadataDocument {
    pub fn new(kind: MetadataKind, content: Value) -> Self {
        Self { kind, content }
    }

    /// Load a document from a JSON file.
    pub fn load(kind: MetadataKind, path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let content = serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { kind, content })
    }

    /// The exact bytes uploaded to the content store.
    ///
    /// Compact JSON with object keys in sorted order, so the same document always
    /// produces the same bytes and therefore the same content identifier.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a `Value` cannot fail.
        serde_json::to_vec(&sorted(&self.content)).unwrap_or_default()
    }
}

/// `value` with every object's keys in sorted order, whatever map ordering serde_json uses.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), sorted(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Reference to an uploaded document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentRef {
    pub kind: MetadataKind,
    pub uri: String,
}

impl ContentRef {
    /// The URI as the factory expects it: raw UTF-8 bytes.
    pub fn uri_bytes(&self) -> Vec<u8> {
        self.uri.as_bytes().to_vec()
    }
}
