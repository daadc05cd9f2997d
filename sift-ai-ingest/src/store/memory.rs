use super::{ChunkStore, StoreReceipt};
use crate::error::Result;
use crate::pipeline::EmbeddedChunk;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Chunk store kept in process memory, keyed by chunk id.
#[derive(Debug, Clone, Default)]
pub struct InMemoryChunkStore {
    chunks: Arc<RwLock<BTreeMap<String, EmbeddedChunk>>>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.read().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<EmbeddedChunk> {
        self.chunks.read().get(id).cloned()
    }

    /// All chunks of a document, ordered by chunk index.
    pub fn document_chunks(&self, document_id: &str) -> Vec<EmbeddedChunk> {
        let mut chunks: Vec<EmbeddedChunk> = self
            .chunks
            .read()
            .values()
            .filter(|c| c.chunk.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk.chunk_index);
        chunks
    }
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn store_chunks(&self, chunks: Vec<EmbeddedChunk>) -> Result<StoreReceipt> {
        let receipt = StoreReceipt::for_chunks(&chunks);
        let mut stored = self.chunks.write();
        for chunk in chunks {
            stored.insert(chunk.chunk.id.clone(), chunk);
        }
        Ok(receipt)
    }
}
