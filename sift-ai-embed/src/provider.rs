//! Embedding provider implementations

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use async_trait::async_trait;
use fnv::FnvHasher;
use half::f16;
use std::hash::Hasher;

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text
    pub embeddings: Vec<Vec<f16>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
    /// How many of the embeddings are zero-filled substitutes rather than model output
    pub degraded: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result from a vector of f16 embeddings.
    ///
    /// The dimension is inferred from the first embedding vector, or 0 when empty.
    pub fn new(embeddings: Vec<Vec<f16>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
            degraded: 0,
        }
    }

    /// A result of `count` zero vectors of the given dimension, all marked degraded.
    pub fn zero_filled(count: usize, dimension: usize) -> Self {
        Self {
            embeddings: vec![vec![f16::ZERO; dimension]; count],
            dimension,
            degraded: count,
        }
    }

    /// Returns the number of embedding vectors in this result.
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    /// Returns `true` if this result contains no embedding vectors.
    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    /// Append another result, keeping the degraded count.
    pub fn extend(&mut self, other: EmbeddingResult) {
        if self.dimension == 0 {
            self.dimension = other.dimension;
        }
        self.degraded += other.degraded;
        self.embeddings.extend(other.embeddings);
    }
}

/// Trait for embedding providers that can generate embeddings from text
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f16>> {
        let texts = vec![text.to_string()];
        let result = self.embed_texts(&texts).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or(EmbedError::CountMismatch {
                expected: 1,
                actual: 0,
            })
    }

    /// Generate embeddings for multiple texts (batch processing)
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Get the dimension of embeddings produced by this provider
    fn embedding_dimension(&self) -> usize;

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn normalize(embedding: &mut [f16]) {
    let norm: f32 = embedding
        .iter()
        .map(|x| x.to_f32() * x.to_f32())
        .sum::<f32>()
        .sqrt();
    if norm > 0.0 {
        for value in embedding.iter_mut() {
            *value = f16::from_f32(value.to_f32() / norm);
        }
    }
}

/// Deterministic embedding provider based on feature hashing.
///
/// Each lower-cased alphanumeric token is hashed with FNV-1a into one of `dimension`
/// buckets, with the sign taken from a high bit of the hash. Texts sharing vocabulary
/// get similar vectors, which is enough for offline ingestion, demos and tests where a
/// real model service is not available.
#[derive(Debug, Clone)]
pub struct HashEmbedProvider {
    config: EmbedConfig,
}

impl HashEmbedProvider {
    pub fn new(config: EmbedConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EmbedConfig {
        &self.config
    }

    fn embed_one(&self, text: &str) -> Vec<f16> {
        let dimension = self.config.dimension;
        let mut buckets = vec![0f32; dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = FnvHasher::default();
            hasher.write(token.to_lowercase().as_bytes());
            let hash = hasher.finish();

            let index = (hash % dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            buckets[index] += sign;
        }

        let mut embedding: Vec<f16> = buckets.into_iter().map(f16::from_f32).collect();
        if self.config.normalize {
            normalize(&mut embedding);
        }
        embedding
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }

        tracing::debug!("Generating embeddings for {} texts", texts.len());

        let mut embeddings = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.config.batch_size) {
            embeddings.extend(chunk.iter().map(|text| self.embed_one(text)));
            // Hashing is CPU bound; give other tasks a chance between model-sized batches.
            tokio::task::yield_now().await;
        }

        Ok(EmbeddingResult {
            embeddings,
            dimension: self.config.dimension,
            degraded: 0,
        })
    }

    fn embedding_dimension(&self) -> usize {
        self.config.dimension
    }

    fn provider_name(&self) -> &str {
        "feature-hash"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(dimension: usize) -> HashEmbedProvider {
        HashEmbedProvider::new(EmbedConfig::default().with_dimension(dimension)).unwrap()
    }

    fn dot(a: &[f16], b: &[f16]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x.to_f32() * y.to_f32()).sum()
    }

    #[test]
    fn test_embedding_result() {
        let embeddings = vec![
            vec![f16::from_f32(0.1), f16::from_f32(0.2), f16::from_f32(0.3)],
            vec![f16::from_f32(0.4), f16::from_f32(0.5), f16::from_f32(0.6)],
        ];
        let mut result = EmbeddingResult::new(embeddings);

        assert_eq!(result.len(), 2);
        assert_eq!(result.dimension, 3);
        assert_eq!(result.degraded, 0);
        assert!(!result.is_empty());

        result.extend(EmbeddingResult::zero_filled(2, 3));
        assert_eq!(result.len(), 4);
        assert_eq!(result.degraded, 2);
        assert!(result.embeddings[3].iter().all(|v| v.to_f32() == 0.0));
    }

    #[tokio::test]
    async fn test_hash_provider_dimension_and_norm() {
        let provider = provider(64);
        let embedding = provider.embed_text("memory aware batching").await.unwrap();

        assert_eq!(embedding.len(), 64);
        assert_eq!(provider.embedding_dimension(), 64);
        assert_eq!(provider.provider_name(), "feature-hash");

        let norm = dot(&embedding, &embedding).sqrt();
        assert!((norm - 1.0).abs() < 0.01, "norm was {norm}");
    }

    #[tokio::test]
    async fn test_hash_provider_is_deterministic() {
        let provider = provider(128);
        let a = provider.embed_text("The quick brown fox").await.unwrap();
        let b = provider.embed_text("the QUICK brown fox").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_shared_vocabulary_is_more_similar() {
        let provider = provider(256);
        let texts = vec![
            "batch size memory pressure heap".to_string(),
            "memory pressure and batch size".to_string(),
            "sunny weather at the beach today".to_string(),
        ];
        let result = provider.embed_texts(&texts).await.unwrap();
        assert_eq!(result.len(), 3);

        let related = dot(&result.embeddings[0], &result.embeddings[1]);
        let unrelated = dot(&result.embeddings[0], &result.embeddings[2]);
        assert!(related > unrelated);
    }

    #[tokio::test]
    async fn test_empty_inputs() {
        let provider = provider(32);
        assert!(provider.embed_texts(&[]).await.unwrap().is_empty());

        let blank = provider.embed_text("   ").await.unwrap();
        assert!(blank.iter().all(|v| v.to_f32() == 0.0));
    }
}
