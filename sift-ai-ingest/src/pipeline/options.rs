//! Options for a document processing run.

use crate::batch::BatchProcessorConfig;
use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use sift_ai_context::{SplitStrategy, SplitterConfig};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingOptions {
    pub strategy: SplitStrategy,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
    /// Copy document metadata onto every chunk
    pub include_metadata: bool,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            strategy: SplitStrategy::Characters,
            chunk_size: 1000,
            chunk_overlap: 200,
            min_chunk_size: 50,
            include_metadata: true,
        }
    }
}

impl ChunkingOptions {
    pub fn splitter_config(&self) -> SplitterConfig {
        SplitterConfig::new(self.strategy)
            .with_chunk_size(self.chunk_size)
            .with_chunk_overlap(self.chunk_overlap)
            .with_min_chunk_size(self.min_chunk_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingOptions {
    /// Embed the chunk text
    pub include_content: bool,
    /// Append scalar chunk metadata to the embedded text
    pub include_metadata: bool,
    pub batch_size: usize,
    pub concurrency: usize,
}

impl Default for EmbeddingOptions {
    fn default() -> Self {
        Self {
            include_content: true,
            include_metadata: true,
            batch_size: 10,
            concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingOptions {
    pub chunking_batch_size: usize,
    pub chunking_concurrency: usize,
    pub store_batch_size: usize,
    pub store_concurrency: usize,
    pub dynamic_batch_size: bool,
    pub monitor_memory: bool,
    pub fail_fast: bool,
    pub delay_between_batches_ms: u64,
}

impl Default for BatchingOptions {
    fn default() -> Self {
        Self {
            chunking_batch_size: 5,
            chunking_concurrency: 2,
            store_batch_size: 50,
            store_concurrency: 1,
            dynamic_batch_size: false,
            monitor_memory: false,
            fail_fast: false,
            delay_between_batches_ms: 0,
        }
    }
}

impl BatchingOptions {
    /// Processor configuration for one phase, sharing the run-wide switches.
    pub(crate) fn processor_config(
        &self,
        operation: &str,
        batch_size: usize,
        concurrency: usize,
    ) -> BatchProcessorConfig {
        BatchProcessorConfig::new(operation)
            .with_batch_size(batch_size)
            .with_concurrency(concurrency)
            .with_dynamic_batch_size(self.dynamic_batch_size)
            .with_monitor_memory(self.monitor_memory)
            .with_fail_fast(self.fail_fast)
            .with_delay_between_batches(Duration::from_millis(self.delay_between_batches_ms))
    }
}

/// Everything that shapes a [`DocumentProcessor`](super::DocumentProcessor) run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentProcessingOptions {
    pub chunking: ChunkingOptions,
    pub embedding: EmbeddingOptions,
    pub batching: BatchingOptions,
}

impl DocumentProcessingOptions {
    pub fn with_strategy(mut self, strategy: SplitStrategy) -> Self {
        self.chunking.strategy = strategy;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize, chunk_overlap: usize) -> Self {
        self.chunking.chunk_size = chunk_size;
        self.chunking.chunk_overlap = chunk_overlap;
        self
    }

    pub fn with_min_chunk_size(mut self, min_chunk_size: usize) -> Self {
        self.chunking.min_chunk_size = min_chunk_size;
        self
    }

    pub fn with_embedding_batches(mut self, batch_size: usize, concurrency: usize) -> Self {
        self.embedding.batch_size = batch_size;
        self.embedding.concurrency = concurrency;
        self
    }

    pub fn with_dynamic_batch_size(mut self, dynamic: bool) -> Self {
        self.batching.dynamic_batch_size = dynamic;
        self
    }

    pub fn with_monitor_memory(mut self, monitor: bool) -> Self {
        self.batching.monitor_memory = monitor;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.batching.fail_fast = fail_fast;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let chunking = &self.chunking;
        if chunking.chunk_size == 0 {
            return Err(IngestError::invalid_config("chunk_size must be greater than zero"));
        }
        if chunking.chunk_overlap >= chunking.chunk_size {
            return Err(IngestError::invalid_config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunking.chunk_overlap, chunking.chunk_size
            )));
        }
        if !self.embedding.include_content && !self.embedding.include_metadata {
            return Err(IngestError::invalid_config(
                "embedding must include content, metadata or both",
            ));
        }

        let sizes = [
            ("embedding.batch_size", self.embedding.batch_size),
            ("embedding.concurrency", self.embedding.concurrency),
            ("batching.chunking_batch_size", self.batching.chunking_batch_size),
            ("batching.chunking_concurrency", self.batching.chunking_concurrency),
            ("batching.store_batch_size", self.batching.store_batch_size),
            ("batching.store_concurrency", self.batching.store_concurrency),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(IngestError::invalid_config(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}
