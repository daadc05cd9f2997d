//! Configuration file for the ingestion runtime.
//!
//! Every section is optional; missing sections and fields keep their defaults.
//!
//! ```toml
//! preset = "large_documents"
//!
//! [probe]
//! memory_budget_mb = 2048
//!
//! [memory]
//! max_batch_size = 32
//! gc_cooldown_ms = 5000
//!
//! [database]
//! cache_ttl_ms = 60000
//!
//! [embedding]
//! dimension = 384
//! on_timeout = "fail"
//!
//! [processing.chunking]
//! strategy = "markdown"
//! ```

use crate::db::DbMemoryConfig;
use crate::error::{IngestError, Result};
use crate::memory::{BatchOptimizerConfig, HeapAnalyzerConfig, MemoryManagerConfig};
use crate::pipeline::{DocumentProcessingOptions, ProcessorPreset};
use serde::{Deserialize, Serialize};
use sift_ai_embed::EmbedConfig;
use std::path::Path;

/// Where memory readings come from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Treat this much memory as the heap ceiling instead of total system memory
    pub memory_budget_mb: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub probe: ProbeConfig,
    pub memory: MemoryManagerConfig,
    pub heap: HeapAnalyzerConfig,
    pub optimizer: BatchOptimizerConfig,
    pub database: DbMemoryConfig,
    pub embedding: EmbedConfig,
    pub processing: DocumentProcessingOptions,
    /// Preset used by the CLI for ingestion runs
    pub preset: ProcessorPreset,
}

impl IngestConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Reject settings that cannot produce a working runtime.
    pub fn validate(&self) -> Result<()> {
        let memory = &self.memory;
        if memory.max_batch_size == 0 {
            return Err(IngestError::invalid_config(
                "memory.max_batch_size must be greater than zero",
            ));
        }
        if memory.min_batch_size > memory.max_batch_size {
            return Err(IngestError::invalid_config(format!(
                "memory.min_batch_size ({}) exceeds memory.max_batch_size ({})",
                memory.min_batch_size, memory.max_batch_size
            )));
        }
        if self.probe.memory_budget_mb == Some(0) {
            return Err(IngestError::invalid_config(
                "probe.memory_budget_mb must be greater than zero",
            ));
        }
        self.embedding.validate()?;
        self.processing.validate()
    }
}
