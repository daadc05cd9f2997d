//! Destinations for embedded chunks.
//!
//! The pipeline hands each batch of [`EmbeddedChunk`]s to a [`ChunkStore`] and collects
//! the returned [`StoreReceipt`]s.
//!
//! ```text
//! DocumentProcessor ── ChunkStore ─┬─ InMemoryChunkStore
//!                                  └─ SqliteChunkStore ── QueryConnection (db manager)
//! ```

use crate::error::Result;
use crate::pipeline::EmbeddedChunk;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryChunkStore;
pub use sqlite::SqliteChunkStore;

/// Acknowledgement for one stored batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreReceipt {
    pub stored: usize,
    pub chunk_ids: Vec<String>,
}

impl StoreReceipt {
    pub fn for_chunks(chunks: &[EmbeddedChunk]) -> Self {
        Self {
            stored: chunks.len(),
            chunk_ids: chunks.iter().map(|c| c.chunk.id.clone()).collect(),
        }
    }
}

/// Persists embedded chunks.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Store a batch of chunks, replacing any chunk with the same id.
    async fn store_chunks(&self, chunks: Vec<EmbeddedChunk>) -> Result<StoreReceipt>;
}
