//! Embedding phase.

use super::document::{DocumentChunk, EmbeddedChunk};
use super::options::DocumentProcessingOptions;
use crate::batch::{BatchMeta, BatchProcessor, BatchRun, EventBus};
use crate::error::Result;
use crate::memory::BatchOptimizer;
use sift_ai_embed::EmbeddingProvider;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

pub(crate) const EMBEDDING_OPERATION: &str = "embedding";

/// Outcome of [`batch_generate_embeddings`]
#[derive(Debug, Clone)]
pub struct EmbeddingRun {
    pub run: BatchRun<EmbeddedChunk>,
    /// Vectors that are zero-filled substitutes for timed out requests
    pub degraded: usize,
}

/// Embed `chunks` in batches through `provider`.
///
/// Provider errors fail the batch they occur in; whether that aborts the run depends
/// on `fail_fast`. Timeouts are handled by the provider itself (see
/// [`TimeoutProvider`](sift_ai_embed::TimeoutProvider)), and any zero-filled vectors it
/// substitutes are counted in [`EmbeddingRun::degraded`].
///
/// With dynamic sizing the batch size comes from
/// [`BatchOptimizer::calculate_embedding_batch_size`] instead of the options.
pub async fn batch_generate_embeddings(
    chunks: Vec<DocumentChunk>,
    provider: Arc<dyn EmbeddingProvider>,
    options: &DocumentProcessingOptions,
    optimizer: &BatchOptimizer,
) -> Result<EmbeddingRun> {
    generate_embeddings(chunks, provider, options, optimizer, EventBus::new()).await
}

pub(crate) async fn generate_embeddings(
    chunks: Vec<DocumentChunk>,
    provider: Arc<dyn EmbeddingProvider>,
    options: &DocumentProcessingOptions,
    optimizer: &BatchOptimizer,
    events: EventBus,
) -> Result<EmbeddingRun> {
    options.validate()?;

    let batch_size = if options.batching.dynamic_batch_size {
        optimizer.calculate_embedding_batch_size(&chunks)
    } else {
        options.embedding.batch_size
    };
    // Sized once up front; the generic per-group resizing does not know about vectors.
    let config = options
        .batching
        .processor_config(
            EMBEDDING_OPERATION,
            batch_size,
            options.embedding.concurrency,
        )
        .with_dynamic_batch_size(false);
    let processor = BatchProcessor::new(config)
        .with_optimizer(optimizer.clone())
        .with_event_bus(events);

    let degraded = Arc::new(AtomicUsize::new(0));
    let include_content = options.embedding.include_content;
    let include_metadata = options.embedding.include_metadata;
    let memory = optimizer.memory().clone();

    let embed_fn = {
        let degraded = degraded.clone();
        move |batch: Vec<DocumentChunk>, meta: BatchMeta| {
            let provider = provider.clone();
            let memory = memory.clone();
            let degraded = degraded.clone();
            async move {
                let tracker = memory.track_batch(EMBEDDING_OPERATION, batch.len());
                let texts: Vec<String> = batch
                    .iter()
                    .map(|chunk| chunk.embedding_text(include_content, include_metadata))
                    .collect();

                let result = provider.embed_texts(&texts).await?;
                if result.len() != batch.len() {
                    anyhow::bail!(
                        "provider returned {} embeddings for {} chunks",
                        result.len(),
                        batch.len()
                    );
                }
                if result.degraded > 0 {
                    warn!(
                        batch_index = meta.batch_index,
                        degraded = result.degraded,
                        "Batch contains zero-filled embeddings"
                    );
                    degraded.fetch_add(result.degraded, Ordering::Relaxed);
                }

                let embedded: Vec<EmbeddedChunk> = batch
                    .into_iter()
                    .zip(result.embeddings)
                    .map(|(chunk, embedding)| EmbeddedChunk { chunk, embedding })
                    .collect();
                let elapsed = tracker.release();
                debug!(
                    batch_index = meta.batch_index,
                    chunks = embedded.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Embedded batch"
                );
                Ok::<_, anyhow::Error>(embedded)
            }
        }
    };

    let run = processor
        .process(chunks, optimizer.optimize_process_fn(EMBEDDING_OPERATION, embed_fn))
        .await?;

    Ok(EmbeddingRun {
        run,
        degraded: degraded.load(Ordering::Relaxed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BatchOptimizerConfig, MemoryManager, MemoryManagerConfig, StaticProbe};
    use async_trait::async_trait;
    use half::f16;
    use sift_ai_embed::{
        EmbedConfig, EmbedError, EmbeddingResult, HashEmbedProvider, TimeoutPolicy,
        TimeoutProvider,
    };
    use std::time::Duration;

    fn optimizer() -> BatchOptimizer {
        let memory = MemoryManager::new(
            MemoryManagerConfig::default(),
            Arc::new(StaticProbe::from_mb(100, 1000)),
            None,
        );
        BatchOptimizer::new(memory, BatchOptimizerConfig::default())
    }

    fn chunks(n: usize) -> Vec<DocumentChunk> {
        (0..n)
            .map(|i| DocumentChunk::new("doc", i, format!("chunk number {i}")))
            .collect()
    }

    /// Fails any batch containing the marker text, sleeps on "slow".
    struct ScriptedProvider;

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        async fn embed_texts(&self, texts: &[String]) -> sift_ai_embed::Result<EmbeddingResult> {
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(EmbedError::External {
                    source: anyhow::anyhow!("model rejected input"),
                });
            }
            if texts.iter().any(|t| t.contains("slow")) {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(EmbeddingResult::new(vec![vec![f16::ONE; 8]; texts.len()]))
        }

        fn embedding_dimension(&self) -> usize {
            8
        }

        fn provider_name(&self) -> &str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn test_embeds_every_chunk_in_order() {
        let provider = Arc::new(
            HashEmbedProvider::new(EmbedConfig::default().with_dimension(16)).unwrap(),
        );
        let options = DocumentProcessingOptions::default().with_embedding_batches(3, 2);
        let optimizer = optimizer();

        let outcome = batch_generate_embeddings(chunks(8), provider, &options, &optimizer)
            .await
            .unwrap();

        assert_eq!(outcome.run.batch_count, 3);
        assert_eq!(outcome.run.results.len(), 8);
        assert_eq!(outcome.degraded, 0);
        for (i, embedded) in outcome.run.results.iter().enumerate() {
            assert_eq!(embedded.chunk.chunk_index, i);
            assert_eq!(embedded.embedding.len(), 16);
        }
        assert_eq!(optimizer.memory().active_batches(), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_fails_the_batch() {
        let mut input = chunks(6);
        input[4].content = "poison".to_string();
        let options = DocumentProcessingOptions::default().with_embedding_batches(2, 1);

        let outcome =
            batch_generate_embeddings(input.clone(), Arc::new(ScriptedProvider), &options, &optimizer())
                .await
                .unwrap();
        assert_eq!(outcome.run.results.len(), 4);
        assert_eq!(outcome.run.failures.len(), 1);
        assert_eq!(outcome.run.failures[0].batch_index, 2);
        assert!(outcome.run.failures[0].error.contains("model rejected input"));

        let fail_fast = options.with_fail_fast(true);
        let err =
            batch_generate_embeddings(input, Arc::new(ScriptedProvider), &fail_fast, &optimizer())
                .await
                .unwrap_err();
        assert!(matches!(
            err,
            crate::error::IngestError::BatchAborted { batch_index: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_timeouts_are_zero_filled_and_counted() {
        let config = EmbedConfig::default()
            .with_dimension(8)
            .with_timeout(Duration::from_millis(20))
            .with_timeout_policy(TimeoutPolicy::ZeroFill);
        let provider = Arc::new(TimeoutProvider::new(Arc::new(ScriptedProvider), &config).unwrap());

        let mut input = chunks(4);
        input[0].content = "slow".to_string();
        let options = DocumentProcessingOptions::default().with_embedding_batches(2, 1);

        let outcome = batch_generate_embeddings(input, provider, &options, &optimizer())
            .await
            .unwrap();
        assert_eq!(outcome.run.results.len(), 4);
        assert_eq!(outcome.degraded, 2);
        assert!(outcome.run.results[0].embedding.iter().all(|v| v.to_f32() == 0.0));
        assert!(outcome.run.results[3].embedding.iter().all(|v| v.to_f32() == 1.0));
    }

    #[tokio::test]
    async fn test_dynamic_sizing_uses_embedding_limit() {
        let provider = Arc::new(
            HashEmbedProvider::new(EmbedConfig::default().with_dimension(4)).unwrap(),
        );
        let options = DocumentProcessingOptions::default()
            .with_embedding_batches(100, 1)
            .with_dynamic_batch_size(true);
        let optimizer = optimizer();

        let outcome = batch_generate_embeddings(chunks(45), provider, &options, &optimizer)
            .await
            .unwrap();
        // Small chunks are capped at the embedding batch limit of 20
        assert_eq!(outcome.run.batch_count, 3);
        assert!(optimizer.history().iter().any(|r| r.operation == "embedding"));
    }
}
