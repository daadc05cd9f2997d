//! Preconfigured document processors sharing one memory manager.

use super::options::DocumentProcessingOptions;
use super::processor::DocumentProcessor;
use crate::error::Result;
use crate::memory::BatchOptimizer;
use serde::{Deserialize, Serialize};
use sift_ai_embed::{EmbedConfig, EmbeddingProvider, TimeoutProvider};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorPreset {
    #[default]
    Standard,
    /// Dynamic sizing and monitoring always on, small chunking batches
    LargeDocuments,
    /// Aggressive sizing and no concurrency
    LowMemory,
}

impl std::str::FromStr for ProcessorPreset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "standard" => Ok(Self::Standard),
            "large_documents" | "large" => Ok(Self::LargeDocuments),
            "low_memory" | "low" => Ok(Self::LowMemory),
            _ => Err(format!("Invalid processor preset: {s}")),
        }
    }
}

/// Builds [`DocumentProcessor`]s around one optimizer and one timeout-guarded provider.
#[derive(Clone)]
pub struct ProcessorFactory {
    provider: Arc<dyn EmbeddingProvider>,
    optimizer: BatchOptimizer,
    options: DocumentProcessingOptions,
}

impl std::fmt::Debug for ProcessorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorFactory")
            .field("provider", &self.provider.provider_name())
            .field("options", &self.options)
            .finish()
    }
}

impl ProcessorFactory {
    /// Wrap `provider` in a [`TimeoutProvider`] configured by `embed_config`.
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        embed_config: &EmbedConfig,
        optimizer: BatchOptimizer,
        options: DocumentProcessingOptions,
    ) -> Result<Self> {
        options.validate()?;
        let provider: Arc<dyn EmbeddingProvider> =
            Arc::new(TimeoutProvider::new(provider, embed_config)?);
        Ok(Self {
            provider,
            optimizer,
            options,
        })
    }

    pub fn provider(&self) -> Arc<dyn EmbeddingProvider> {
        self.provider.clone()
    }

    pub fn optimizer(&self) -> &BatchOptimizer {
        &self.optimizer
    }

    pub fn base_options(&self) -> &DocumentProcessingOptions {
        &self.options
    }

    pub fn create(&self, preset: ProcessorPreset) -> DocumentProcessor {
        match preset {
            ProcessorPreset::Standard => self.standard(),
            ProcessorPreset::LargeDocuments => self.large_documents(),
            ProcessorPreset::LowMemory => self.low_memory(),
        }
    }

    pub fn standard(&self) -> DocumentProcessor {
        DocumentProcessor::new(
            self.provider.clone(),
            self.optimizer.clone(),
            self.options.clone(),
        )
    }

    pub fn large_documents(&self) -> DocumentProcessor {
        let mut options = self.options.clone();
        options.batching.dynamic_batch_size = true;
        options.batching.monitor_memory = true;
        options.batching.chunking_batch_size = 2;
        options.batching.chunking_concurrency = 1;
        options.embedding.batch_size = options.embedding.batch_size.min(5);

        DocumentProcessor::new(self.provider.clone(), self.optimizer.clone(), options)
    }

    /// Uses its own aggressive optimizer over the shared memory manager.
    pub fn low_memory(&self) -> DocumentProcessor {
        let mut options = self.options.clone();
        options.batching.monitor_memory = true;
        options.batching.chunking_batch_size = 2;
        options.batching.chunking_concurrency = 1;
        options.batching.store_batch_size = options.batching.store_batch_size.min(20);
        options.batching.store_concurrency = 1;
        options.embedding.batch_size = options.embedding.batch_size.min(5);
        options.embedding.concurrency = 1;

        let config = self.optimizer.config().clone().with_aggressive(true);
        let optimizer = BatchOptimizer::new(self.optimizer.memory().clone(), config);
        DocumentProcessor::new(self.provider.clone(), optimizer, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BatchOptimizerConfig, MemoryManager, MemoryManagerConfig, StaticProbe};
    use crate::pipeline::Document;
    use sift_ai_embed::HashEmbedProvider;

    fn factory() -> ProcessorFactory {
        let memory = MemoryManager::new(
            MemoryManagerConfig::default(),
            Arc::new(StaticProbe::from_mb(100, 1000)),
            None,
        );
        let embed_config = EmbedConfig::default().with_dimension(16);
        let provider = Arc::new(HashEmbedProvider::new(embed_config.clone()).unwrap());
        ProcessorFactory::new(
            provider,
            &embed_config,
            BatchOptimizer::new(memory, BatchOptimizerConfig::default()),
            DocumentProcessingOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_preset_parsing() {
        let parse = |s: &str| s.parse::<ProcessorPreset>().unwrap();
        assert_eq!(parse("standard"), ProcessorPreset::Standard);
        assert_eq!(parse("large-documents"), ProcessorPreset::LargeDocuments);
        assert_eq!(parse("LOW_MEMORY"), ProcessorPreset::LowMemory);
        assert!("fast".parse::<ProcessorPreset>().is_err());
    }

    #[test]
    fn test_presets() {
        let factory = factory();

        let standard = factory.create(ProcessorPreset::Standard);
        assert_eq!(standard.options(), factory.base_options());
        assert!(!standard.optimizer().config().aggressive);

        let large = factory.create(ProcessorPreset::LargeDocuments);
        assert!(large.options().batching.dynamic_batch_size);
        assert!(large.options().batching.monitor_memory);
        assert_eq!(large.options().batching.chunking_batch_size, 2);

        let low = factory.create(ProcessorPreset::LowMemory);
        assert!(low.optimizer().is_aggressive());
        assert_eq!(low.options().embedding.concurrency, 1);
        assert_eq!(low.options().embedding.batch_size, 5);
        assert!(!factory.optimizer().is_aggressive());
    }

    #[tokio::test]
    async fn test_presets_share_memory_manager() {
        let factory = factory();
        let low = factory.low_memory();
        low.process_documents(vec![Document::new("shared memory manager")], None)
            .await
            .unwrap();

        // Monitoring on the low-memory processor lands in the shared history
        assert!(!factory.optimizer().memory().history().is_empty());
    }
}
