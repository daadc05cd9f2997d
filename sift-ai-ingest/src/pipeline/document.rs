//! Documents, their chunks, and embedded chunks.

use crate::memory::EstimateSize;
use half::f16;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Number of hex characters kept from the content hash when deriving an id
const DERIVED_ID_LEN: usize = 16;

/// A document to be chunked and embedded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier; derived from the content when absent
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: None,
            content: content.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The explicit id, or the first 16 hex characters of the blake3 hash of the content.
    pub fn resolved_id(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => content_id(&self.content),
        }
    }
}

/// Short content-derived identifier.
pub fn content_id(content: &str) -> String {
    let hash = blake3::hash(content.as_bytes());
    let mut id = hex::encode(hash.as_bytes());
    id.truncate(DERIVED_ID_LEN);
    id
}

fn metadata_bytes(metadata: &Map<String, Value>) -> usize {
    if metadata.is_empty() {
        return 0;
    }
    metadata.values().map(EstimateSize::estimated_bytes).sum::<usize>()
        + metadata.keys().map(|k| k.estimated_bytes()).sum::<usize>()
}

impl EstimateSize for Document {
    fn estimated_bytes(&self) -> usize {
        self.content.estimated_bytes() + metadata_bytes(&self.metadata)
    }
}

/// A piece of a document's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    /// `"{document_id}-chunk-{chunk_index}"`
    pub id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl DocumentChunk {
    pub fn new(document_id: &str, chunk_index: usize, content: impl Into<String>) -> Self {
        Self {
            id: chunk_id(document_id, chunk_index),
            document_id: document_id.to_string(),
            chunk_index,
            content: content.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Text submitted to the embedding provider.
    ///
    /// With `include_metadata`, scalar metadata values are appended as `key: value` lines
    /// so they influence the vector.
    pub fn embedding_text(&self, include_content: bool, include_metadata: bool) -> String {
        let mut text = if include_content {
            self.content.clone()
        } else {
            String::new()
        };
        if include_metadata {
            for (key, value) in &self.metadata {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(key);
                text.push_str(": ");
                text.push_str(&rendered);
            }
        }
        text
    }
}

pub fn chunk_id(document_id: &str, chunk_index: usize) -> String {
    format!("{document_id}-chunk-{chunk_index}")
}

impl EstimateSize for DocumentChunk {
    fn estimated_bytes(&self) -> usize {
        self.content.estimated_bytes() + metadata_bytes(&self.metadata)
    }
}

/// A chunk together with its embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    #[serde(flatten)]
    pub chunk: DocumentChunk,
    pub embedding: Vec<f16>,
}

impl EmbeddedChunk {
    pub fn id(&self) -> &str {
        &self.chunk.id
    }
}

impl EstimateSize for EmbeddedChunk {
    fn estimated_bytes(&self) -> usize {
        self.chunk.estimated_bytes() + self.embedding.estimated_bytes()
    }
}

/// Result of chunking one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkedDocument {
    pub document_id: String,
    pub chunks: Vec<DocumentChunk>,
}
