//! Timeout guard for embedding providers

use crate::config::{EmbedConfig, TimeoutPolicy};
use crate::error::{EmbedError, Result};
use crate::provider::{EmbeddingProvider, EmbeddingResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Wraps a provider so that every call is bounded by a timeout.
///
/// The inner future is dropped when the timer fires, which cancels the request rather
/// than leaving it running in the background. What the caller sees then depends on
/// the configured [`TimeoutPolicy`]: zero vectors of the configured dimension (one per
/// input text, counted as degraded) or an [`EmbedError::Timeout`].
///
/// Errors reported by the inner provider are never masked; they always propagate.
#[derive(Clone)]
pub struct TimeoutProvider {
    inner: Arc<dyn EmbeddingProvider>,
    timeout: Duration,
    policy: TimeoutPolicy,
    dimension: usize,
    timeouts: Arc<AtomicUsize>,
}

impl std::fmt::Debug for TimeoutProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutProvider")
            .field("inner", &self.inner.provider_name())
            .field("timeout", &self.timeout)
            .field("policy", &self.policy)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl TimeoutProvider {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, config: &EmbedConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner,
            timeout: config.timeout(),
            policy: config.on_timeout,
            dimension: config.dimension,
            timeouts: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of calls that hit the timeout so far.
    pub fn timeout_count(&self) -> usize {
        self.timeouts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EmbeddingProvider for TimeoutProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        match tokio::time::timeout(self.timeout, self.inner.embed_texts(texts)).await {
            Ok(result) => {
                let result = result?;
                if result.len() != texts.len() {
                    return Err(EmbedError::CountMismatch {
                        expected: texts.len(),
                        actual: result.len(),
                    });
                }
                Ok(result)
            }
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                match self.policy {
                    TimeoutPolicy::ZeroFill => {
                        tracing::warn!(
                            provider = self.inner.provider_name(),
                            texts = texts.len(),
                            timeout_ms = self.timeout.as_millis() as u64,
                            "Embedding request timed out, substituting zero vectors"
                        );
                        Ok(EmbeddingResult::zero_filled(texts.len(), self.dimension))
                    }
                    TimeoutPolicy::Fail => Err(EmbedError::Timeout {
                        after: self.timeout,
                    }),
                }
            }
        }
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }
}
