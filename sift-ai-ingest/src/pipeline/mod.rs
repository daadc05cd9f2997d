//! Document processing pipeline.
//!
//! Documents are chunked, the chunks embedded, and the embedded chunks optionally
//! handed to a [`ChunkStore`](crate::store::ChunkStore). Every phase runs through the
//! generic [`BatchProcessor`](crate::batch::BatchProcessor) with memory accounting from
//! the [`BatchOptimizer`](crate::memory::BatchOptimizer).
//!
//! Large corpora (documents averaging over 50 KB, or over 1 MB in total) always run
//! with dynamic batch sizing and memory monitoring, whatever the options say.

pub mod chunking;
pub mod document;
pub mod embedding;
pub mod factory;
pub mod options;
pub mod processor;

pub use chunking::batch_chunk_documents;
pub use document::{ChunkedDocument, Document, DocumentChunk, EmbeddedChunk, chunk_id, content_id};
pub use embedding::{EmbeddingRun, batch_generate_embeddings};
pub use factory::{ProcessorFactory, ProcessorPreset};
pub use options::{BatchingOptions, ChunkingOptions, DocumentProcessingOptions, EmbeddingOptions};
pub use processor::{DocumentProcessor, ProcessingOutcome, needs_escalation};
