//! Configuration for embedding providers

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Output size of the reference embedding service; used when nothing else is configured.
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 768;

/// What to do when a provider call exceeds its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Substitute zero vectors so downstream item counts stay intact.
    /// Substituted vectors are counted in [`EmbeddingResult::degraded`](crate::EmbeddingResult).
    #[default]
    ZeroFill,
    /// Surface the timeout as [`EmbedError::Timeout`].
    Fail,
}

/// Configuration for embedding providers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// Name of the embedding model, used in logs and statistics
    pub model_name: String,
    /// Dimension of produced vectors, also the length of zero-filled fallbacks
    pub dimension: usize,
    /// Maximum number of texts sent to the model in one call
    pub batch_size: usize,
    /// Whether to L2-normalize embeddings
    pub normalize: bool,
    /// Per-call timeout in milliseconds
    pub timeout_ms: u64,
    /// Behaviour on timeout
    pub on_timeout: TimeoutPolicy,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            model_name: "feature-hash".to_string(),
            dimension: DEFAULT_EMBEDDING_DIMENSION,
            batch_size: 32,
            normalize: true,
            timeout_ms: 30_000,
            on_timeout: TimeoutPolicy::ZeroFill,
        }
    }
}

impl EmbedConfig {
    /// Create a configuration for the named model with default settings.
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Self::default()
        }
    }

    /// Set the vector dimension (builder style)
    pub fn with_dimension(self, dimension: usize) -> Self {
        Self { dimension, ..self }
    }

    /// Set the batch size for embedding generation (builder style)
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    /// Set whether to normalize embeddings (builder style)
    pub fn with_normalize(self, normalize: bool) -> Self {
        Self { normalize, ..self }
    }

    /// Set the per-call timeout (builder style)
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout_ms: timeout.as_millis() as u64,
            ..self
        }
    }

    /// Set the timeout policy (builder style)
    pub fn with_timeout_policy(self, on_timeout: TimeoutPolicy) -> Self {
        Self { on_timeout, ..self }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(EmbedError::invalid_config("dimension must be greater than zero"));
        }
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be greater than zero"));
        }
        if self.timeout_ms == 0 {
            return Err(EmbedError::invalid_config("timeout_ms must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EmbedConfig::default();
        assert_eq!(config.model_name(), "feature-hash");
        assert_eq!(config.dimension, 768);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.on_timeout, TimeoutPolicy::ZeroFill);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = EmbedConfig::new("remote-model")
            .with_dimension(384)
            .with_batch_size(8)
            .with_normalize(false)
            .with_timeout(Duration::from_millis(250))
            .with_timeout_policy(TimeoutPolicy::Fail);

        assert_eq!(config.model_name(), "remote-model");
        assert_eq!(config.dimension, 384);
        assert_eq!(config.batch_size, 8);
        assert!(!config.normalize);
        assert_eq!(config.timeout_ms, 250);
        assert_eq!(config.on_timeout, TimeoutPolicy::Fail);
    }

    #[test]
    fn test_invalid_config() {
        assert!(EmbedConfig::default().with_dimension(0).validate().is_err());
        assert!(EmbedConfig::default().with_batch_size(0).validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EmbedConfig =
            serde_json::from_str(r#"{"dimension": 16, "on_timeout": "fail"}"#).unwrap();
        assert_eq!(config.dimension, 16);
        assert_eq!(config.on_timeout, TimeoutPolicy::Fail);
        assert_eq!(config.batch_size, 32);
    }
}
