//! sift-ai-ingest: memory-aware document ingestion
//!
//! Documents are chunked, embedded and stored in batches whose size follows the
//! memory actually available to the process. The same memory readings drive heap
//! diagnostics and the query cache of the database layer.
//!
//! ## Key Modules
//!
//! - **[`memory`]**: memory manager, heap analyzer and batch optimizer
//! - **[`batch`]**: generic batch processor with progress events
//! - **[`pipeline`]**: documents, chunking and embedding phases, processors and presets
//! - **[`store`]**: destinations for embedded chunks (in-memory and SQLite)
//! - **[`db`]**: connection tracking, query caching and maintenance
//! - **[`config`]** / **[`runtime`]**: TOML configuration and the composition root
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sift_ai_ingest::{Document, IngestConfig, IngestRuntime};
//!
//! # async fn example() -> sift_ai_ingest::Result<()> {
//! let runtime = IngestRuntime::from_system(IngestConfig::default())?;
//! runtime.start();
//!
//! let outcome = runtime
//!     .processor()
//!     .process_documents(vec![Document::new("Some text worth embedding")], None)
//!     .await?;
//! println!("{} chunks embedded", outcome.embedding_count);
//!
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Documents → chunking → embedding → ChunkStore
//!                 ↓           ↓          ↓
//!           BatchProcessor (sized by BatchOptimizer)
//!                             ↓
//!        MemoryManager ← HeapAnalyzer ← DbMemoryManager
//! ```

pub mod batch;
pub mod config;
pub mod db;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod runtime;
pub mod store;

pub use batch::{BatchEvent, BatchProcessor, BatchProcessorConfig, BatchRun, process_in_batches};
pub use config::{IngestConfig, ProbeConfig};
pub use db::{DbMemoryConfig, DbMemoryManager, QueryConnection, RegisterOptions};
pub use error::{IngestError, Result};
pub use memory::{BatchOptimizer, HeapAnalyzer, MemoryManager, MemoryProbe, StaticProbe, SysinfoProbe};
pub use pipeline::{
    Document, DocumentChunk, DocumentProcessingOptions, DocumentProcessor, EmbeddedChunk,
    ProcessingOutcome, ProcessorFactory, ProcessorPreset,
};
pub use runtime::{IngestRuntime, RuntimeStatus};
pub use store::{ChunkStore, InMemoryChunkStore, SqliteChunkStore, StoreReceipt};
