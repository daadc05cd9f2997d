//! Error types for the ingestion core

use sift_ai_context::SplitError;
use sift_ai_embed::EmbedError;

/// Result type for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Error type for the ingestion core.
///
/// Validation problems (`InvalidInput`, `InvalidConfig`) are raised before any work
/// starts. Batch failures only surface as `BatchAborted` when fail-fast was requested;
/// otherwise they are reported inside the run result.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// A caller-supplied argument is missing or malformed
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// A configuration value is out of range
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// A batch failed while fail-fast was enabled
    #[error("Batch {batch_index} (items {start}..{end}) failed: {source}")]
    BatchAborted {
        batch_index: usize,
        start: usize,
        end: usize,
        #[source]
        source: anyhow::Error,
    },

    /// No connection is registered under the given id
    #[error("Unknown connection: {id}")]
    UnknownConnection { id: String },

    /// A query executed through a monitored connection failed
    #[error("Query {method} on connection {connection} failed: {source}")]
    Query {
        connection: String,
        method: String,
        #[source]
        source: anyhow::Error,
    },

    /// Text splitting could not be configured
    #[error(transparent)]
    Split(#[from] SplitError),

    /// Embedding generation failed
    #[error(transparent)]
    Embed(#[from] EmbedError),

    /// Storage backend errors
    #[error("Database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },

    /// JSON (de)serialization errors
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    /// Configuration file parse errors
    #[error("Config parse error: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },

    /// IO errors
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl IngestError {
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
