//! Composition root: builds every component from one [`IngestConfig`].

use crate::config::IngestConfig;
use crate::db::{DbMemoryManager, DbStatistics};
use crate::error::Result;
use crate::memory::{
    BatchOptimizer, HeapAnalysis, HeapAnalyzer, MemoryManager, MemoryProbe, MemoryStatistics,
    MemoryTrend, OptimizerStatistics, ReclaimHook, SysinfoProbe,
};
use crate::memory::probe::MB;
use crate::pipeline::{DocumentProcessor, ProcessorFactory};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sift_ai_embed::{EmbeddingProvider, HashEmbedProvider};
use std::sync::Arc;
use tracing::info;

/// Everything the runtime can report about itself.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub timestamp: DateTime<Utc>,
    pub running: bool,
    pub embedding_provider: String,
    pub embedding_dimension: usize,
    pub memory: MemoryStatistics,
    pub trend: MemoryTrend,
    pub optimizer: OptimizerStatistics,
    pub optimizer_recommendations: Vec<String>,
    pub database: DbStatistics,
}

/// Owns the memory manager, heap analyzer, optimizer, database manager and processor
/// factory of one process.
///
/// Nothing starts on construction; call [`start`](Self::start) to run the database
/// maintenance sweep and [`shutdown`](Self::shutdown) to stop it and close connections.
#[derive(Debug, Clone)]
pub struct IngestRuntime {
    config: IngestConfig,
    memory: MemoryManager,
    heap: HeapAnalyzer,
    optimizer: BatchOptimizer,
    db: DbMemoryManager,
    factory: ProcessorFactory,
}

impl IngestRuntime {
    /// Build with the feature-hashing embedding provider from `config.embedding`.
    pub fn from_config(
        config: IngestConfig,
        probe: Arc<dyn MemoryProbe>,
        reclaim: Option<ReclaimHook>,
    ) -> Result<Self> {
        let provider = Arc::new(HashEmbedProvider::new(config.embedding.clone())?);
        Self::with_provider(config, probe, reclaim, provider)
    }

    /// Build around the process's own memory, as reported by the operating system.
    pub fn from_system(config: IngestConfig) -> Result<Self> {
        let mut probe = SysinfoProbe::new();
        if let Some(budget_mb) = config.probe.memory_budget_mb {
            probe = probe.with_budget(budget_mb * MB);
        }
        Self::from_config(config, Arc::new(probe), None)
    }

    pub fn with_provider(
        config: IngestConfig,
        probe: Arc<dyn MemoryProbe>,
        reclaim: Option<ReclaimHook>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let memory = MemoryManager::new(config.memory.clone(), probe, reclaim);
        let heap = HeapAnalyzer::new(memory.clone(), config.heap.clone());
        let optimizer = BatchOptimizer::new(memory.clone(), config.optimizer.clone());
        let db = DbMemoryManager::new(config.database.clone(), memory.clone(), heap.clone());
        let factory = ProcessorFactory::new(
            provider,
            &config.embedding,
            optimizer.clone(),
            config.processing.clone(),
        )?;

        Ok(Self {
            config,
            memory,
            heap,
            optimizer,
            db,
            factory,
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn heap(&self) -> &HeapAnalyzer {
        &self.heap
    }

    pub fn optimizer(&self) -> &BatchOptimizer {
        &self.optimizer
    }

    pub fn db(&self) -> &DbMemoryManager {
        &self.db
    }

    pub fn factory(&self) -> &ProcessorFactory {
        &self.factory
    }

    /// Processor for the configured preset.
    pub fn processor(&self) -> DocumentProcessor {
        self.factory.create(self.config.preset)
    }

    /// Start background maintenance. Must be called inside a tokio runtime.
    pub fn start(&self) {
        self.db.start();
        info!(preset = ?self.config.preset, "Ingest runtime started");
    }

    pub async fn shutdown(&self) {
        self.db.shutdown().await;
        info!("Ingest runtime stopped");
    }

    pub fn analyze_heap(&self) -> HeapAnalysis {
        self.heap.analyze_heap()
    }

    pub fn status(&self) -> RuntimeStatus {
        let provider = self.factory.provider();
        RuntimeStatus {
            timestamp: Utc::now(),
            running: self.db.is_running(),
            embedding_provider: provider.provider_name().to_string(),
            embedding_dimension: provider.embedding_dimension(),
            memory: self.memory.statistics(),
            trend: self.memory.get_memory_trend(self.config.heap.trend_window()),
            optimizer: self.optimizer.statistics(),
            optimizer_recommendations: self.optimizer.recommendations(),
            database: self.db.statistics(),
        }
    }
}
