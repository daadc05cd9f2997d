//! # sift-ai-embed
//!
//! Embedding provider abstractions for the sift ingestion pipeline.
//!
//! Real embedding models live behind remote services or heavyweight runtimes, so this
//! crate only defines the seam ([`EmbeddingProvider`]) and a few building blocks around it:
//!
//! - [`HashEmbedProvider`]: a deterministic feature-hashing provider for offline use
//! - [`TimeoutProvider`]: bounds each call with a timeout and applies a [`TimeoutPolicy`]
//! - [`EmbedConfig`]: dimension, batch size, normalization and timeout settings
//!
//! ## Quick Start
//!
//! ```
//! use sift_ai_embed::{EmbedConfig, EmbeddingProvider, HashEmbedProvider};
//!
//! # async fn example() -> sift_ai_embed::Result<()> {
//! let provider = HashEmbedProvider::new(EmbedConfig::default().with_dimension(64))?;
//!
//! let texts = vec!["Hello world".to_string(), "How are you?".to_string()];
//! let result = provider.embed_texts(&texts).await?;
//!
//! println!("Generated {} embeddings of dimension {}", result.len(), result.dimension);
//! # Ok(())
//! # }
//! ```
//!
//! ## Memory Usage
//!
//! Embeddings are stored as half-precision (f16) vectors to halve the working set of
//! large ingestion runs.

pub mod config;
pub mod error;
pub mod provider;
pub mod timeout;

// Re-export main types for easy access
pub use config::{DEFAULT_EMBEDDING_DIMENSION, EmbedConfig, TimeoutPolicy};
pub use error::{EmbedError, Result};
pub use provider::{EmbeddingProvider, EmbeddingResult, HashEmbedProvider, normalize};
pub use timeout::TimeoutProvider;
