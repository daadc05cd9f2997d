//! Batch optimizer: memory manager sizing plus an aggressive mode, a decision log and
//! per-operation memory accounting.

use super::manager::{BatchSizeOptions, MemoryManager, MemoryUsage};
use super::probe::MB;
use super::size::EstimateSize;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Utilization above the target at which aggressive sizing switches on
const AGGRESSIVE_MARGIN_PCT: f64 = 15.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptimizerConfig {
    /// Utilization the optimizer tries to stay under
    pub target_utilization_pct: f64,
    /// Always size aggressively, regardless of utilization
    pub aggressive: bool,
    /// Batch footprint used while sizing aggressively
    pub aggressive_target_batch_size_mb: f64,
    /// Number of sizing decisions kept for recommendations
    pub history_limit: usize,
    /// Average batch size above which an operation is flagged
    pub large_average_batch_size: usize,
    /// Per-item memory cost above which an operation is flagged
    pub high_memory_per_item_bytes: u64,
    /// Batches larger than this may reclaim before running
    pub prereclaim_min_batch: usize,
    /// Heap growth across one batch that triggers reclamation afterwards
    pub reclaim_delta_bytes: u64,
}

impl Default for BatchOptimizerConfig {
    fn default() -> Self {
        Self {
            target_utilization_pct: 70.0,
            aggressive: false,
            aggressive_target_batch_size_mb: 5.0,
            history_limit: 20,
            large_average_batch_size: 40,
            high_memory_per_item_bytes: MB,
            prereclaim_min_batch: 5,
            reclaim_delta_bytes: 50 * MB,
        }
    }
}

impl BatchOptimizerConfig {
    pub fn with_aggressive(mut self, aggressive: bool) -> Self {
        self.aggressive = aggressive;
        self
    }

    pub fn with_target_utilization_pct(mut self, target_utilization_pct: f64) -> Self {
        self.target_utilization_pct = target_utilization_pct;
        self
    }
}

/// One sizing decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOperationRecord {
    pub timestamp: DateTime<Utc>,
    pub size: usize,
    pub operation: String,
    pub item_count: usize,
    pub memory: MemoryUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStatistics {
    pub operation: String,
    /// Sizing decisions still in the history
    pub decisions: usize,
    pub average_batch_size: f64,
    /// Batches measured by an optimized process function
    pub measured_batches: u64,
    pub average_bytes_per_item: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerStatistics {
    pub aggressive: bool,
    pub history_len: usize,
    pub operations: Vec<OperationStatistics>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ItemMemory {
    batches: u64,
    items: u64,
    delta_bytes: i64,
}

impl ItemMemory {
    fn bytes_per_item(&self) -> Option<f64> {
        (self.items > 0).then(|| self.delta_bytes as f64 / self.items as f64)
    }
}

#[derive(Debug, Default)]
struct OptimizerState {
    history: VecDeque<BatchOperationRecord>,
    item_memory: HashMap<String, ItemMemory>,
}

/// Sizes batches through a [`MemoryManager`], tightening limits when memory runs high.
#[derive(Debug, Clone)]
pub struct BatchOptimizer {
    memory: MemoryManager,
    config: BatchOptimizerConfig,
    state: Arc<Mutex<OptimizerState>>,
}

impl BatchOptimizer {
    pub fn new(memory: MemoryManager, config: BatchOptimizerConfig) -> Self {
        Self {
            memory,
            config,
            state: Arc::new(Mutex::new(OptimizerState::default())),
        }
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn config(&self) -> &BatchOptimizerConfig {
        &self.config
    }

    /// Whether sizing is currently aggressive, either by configuration or because
    /// utilization is well above the target.
    pub fn is_aggressive(&self) -> bool {
        self.config.aggressive
            || self.memory.utilization_pct()
                > self.config.target_utilization_pct + AGGRESSIVE_MARGIN_PCT
    }

    fn sizing_options(&self) -> BatchSizeOptions {
        if !self.is_aggressive() {
            return BatchSizeOptions::default();
        }
        let memory_config = self.memory.config();
        let max = (memory_config.max_batch_size / 2).max(memory_config.min_batch_size.max(1));
        BatchSizeOptions::default()
            .with_max_batch_size(max)
            .with_target_batch_size_mb(self.config.aggressive_target_batch_size_mb)
    }

    /// Batch size for `items`, recorded under `operation`.
    pub fn calculate_batch_size<T: EstimateSize>(&self, items: &[T], operation: &str) -> usize {
        let options = self.sizing_options();
        let size = self.memory.calculate_optimal_batch_size(items, &options);
        self.record(operation, size, items.len());
        size
    }

    /// Embedding batch size, halved again while sizing aggressively.
    pub fn calculate_embedding_batch_size<T: EstimateSize>(&self, items: &[T]) -> usize {
        let mut size = self.memory.calculate_embedding_batch_size(items);
        if self.is_aggressive() {
            size = (size / 2).max(self.memory.config().min_batch_size.max(1));
        }
        self.record("embedding", size, items.len());
        size
    }

    fn record(&self, operation: &str, size: usize, item_count: usize) {
        let record = BatchOperationRecord {
            timestamp: Utc::now(),
            size,
            operation: operation.to_string(),
            item_count,
            memory: self.memory.get_current_memory_usage(),
        };
        debug!(operation, size, item_count, "Recorded batch sizing decision");

        let mut state = self.state.lock();
        state.history.push_back(record);
        while state.history.len() > self.config.history_limit {
            state.history.pop_front();
        }
    }

    fn record_item_memory(&self, operation: &str, delta_bytes: i64, items: usize) {
        let mut state = self.state.lock();
        let entry = state.item_memory.entry(operation.to_string()).or_default();
        entry.batches += 1;
        entry.items += items as u64;
        entry.delta_bytes += delta_bytes;
    }

    /// Wrap a batch process function with memory accounting.
    ///
    /// Large batches reclaim first when memory is under pressure. The heap delta across
    /// each call is recorded per item for `operation`, and a large delta triggers a
    /// reclamation pass afterwards.
    pub fn optimize_process_fn<T, A, R, F, Fut>(
        &self,
        operation: &str,
        process_fn: F,
    ) -> impl Fn(Vec<T>, A) -> BoxFuture<'static, anyhow::Result<R>>
    + Send
    + Sync
    + Clone
    + use<T, A, R, F, Fut>
    where
        T: Send + 'static,
        A: Send + 'static,
        R: Send + 'static,
        F: Fn(Vec<T>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let optimizer = self.clone();
        let operation: Arc<str> = Arc::from(operation);
        let process_fn = Arc::new(process_fn);

        move |items: Vec<T>, meta: A| {
            let optimizer = optimizer.clone();
            let operation = operation.clone();
            let process_fn = process_fn.clone();

            async move {
                let count = items.len();
                let memory = &optimizer.memory;

                let prereclaim = count > optimizer.config.prereclaim_min_batch;
                if prereclaim && memory.is_under_memory_pressure() {
                    memory.try_reclaim(false);
                }

                let before = memory.get_current_memory_usage().heap_used;
                let result = process_fn(items, meta).await;
                let after = memory.get_current_memory_usage().heap_used;
                let delta = after as i64 - before as i64;

                if count > 0 {
                    optimizer.record_item_memory(&operation, delta, count);
                }
                if delta > optimizer.config.reclaim_delta_bytes as i64 {
                    info!(
                        operation = %operation,
                        delta_mb = delta / MB as i64,
                        "Large heap growth across batch, reclaiming"
                    );
                    memory.try_reclaim(false);
                }
                result
            }
            .boxed()
        }
    }

    pub fn history(&self) -> Vec<BatchOperationRecord> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn statistics(&self) -> OptimizerStatistics {
        let state = self.state.lock();

        let mut sizes: HashMap<&str, (usize, usize)> = HashMap::new();
        for record in &state.history {
            let entry = sizes.entry(record.operation.as_str()).or_default();
            entry.0 += 1;
            entry.1 += record.size;
        }

        let mut names: Vec<&str> = sizes
            .keys()
            .copied()
            .chain(state.item_memory.keys().map(String::as_str))
            .collect();
        names.sort_unstable();
        names.dedup();

        let operations = names
            .into_iter()
            .map(|name| {
                let (decisions, total) = sizes.get(name).copied().unwrap_or_default();
                let item_memory = state.item_memory.get(name).copied().unwrap_or_default();
                OperationStatistics {
                    operation: name.to_string(),
                    decisions,
                    average_batch_size: if decisions > 0 {
                        total as f64 / decisions as f64
                    } else {
                        0.0
                    },
                    measured_batches: item_memory.batches,
                    average_bytes_per_item: item_memory.bytes_per_item(),
                }
            })
            .collect();

        OptimizerStatistics {
            aggressive: self.is_aggressive(),
            history_len: state.history.len(),
            operations,
        }
    }

    pub fn recommendations(&self) -> Vec<String> {
        let stats = self.statistics();
        let mut recommendations = Vec::new();

        if stats.aggressive {
            recommendations.push(format!(
                "Memory utilization is above {:.0}%, batch sizes are being reduced",
                self.config.target_utilization_pct + AGGRESSIVE_MARGIN_PCT
            ));
        }

        for op in &stats.operations {
            let large_average = self.config.large_average_batch_size as f64;
            if op.decisions > 0 && op.average_batch_size > large_average {
                recommendations.push(format!(
                    "Operation '{}' averages {:.1} items per batch; consider reducing the maximum batch size",
                    op.operation, op.average_batch_size
                ));
            }
            let per_item = op.average_bytes_per_item.unwrap_or(0.0);
            if per_item > self.config.high_memory_per_item_bytes as f64 {
                recommendations.push(format!(
                    "Operation '{}' uses {:.2} MB per item; consider smaller batches or streaming its input",
                    op.operation,
                    per_item / MB as f64
                ));
            }
        }

        recommendations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::manager::MemoryManagerConfig;
    use crate::memory::probe::{ReclaimHook, StaticProbe};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn optimizer(probe: Arc<StaticProbe>, hook: Option<ReclaimHook>) -> BatchOptimizer {
        let memory = MemoryManager::new(MemoryManagerConfig::default(), probe, hook);
        BatchOptimizer::new(memory, BatchOptimizerConfig::default())
    }

    fn kilobyte_items(count: usize) -> Vec<String> {
        (0..count).map(|_| "x".repeat(512)).collect()
    }

    #[test]
    fn test_normal_sizing_uses_manager_limits() {
        let optimizer = optimizer(Arc::new(StaticProbe::from_mb(100, 1000)), None);
        assert!(!optimizer.is_aggressive());
        assert_eq!(optimizer.calculate_batch_size(&kilobyte_items(100), "chunking"), 50);
        assert_eq!(optimizer.history().len(), 1);
        assert_eq!(optimizer.history()[0].operation, "chunking");
    }

    #[test]
    fn test_aggressive_mode_halves_max() {
        let probe = Arc::new(StaticProbe::from_mb(900, 1000));
        let optimizer = optimizer(probe.clone(), None);
        assert!(optimizer.is_aggressive());
        assert_eq!(optimizer.calculate_batch_size(&kilobyte_items(100), "chunking"), 25);

        // 2 MB items: 5 MB target fits two of them
        let big: Vec<String> = (0..10).map(|_| "x".repeat(1024 * 1024)).collect();
        assert_eq!(optimizer.calculate_batch_size(&big, "chunking"), 2);

        probe.set_used_mb(500);
        assert!(!optimizer.is_aggressive());

        let forced = BatchOptimizer::new(
            MemoryManager::new(MemoryManagerConfig::default(), probe, None),
            BatchOptimizerConfig::default().with_aggressive(true),
        );
        assert!(forced.is_aggressive());
    }

    #[test]
    fn test_history_is_bounded() {
        let optimizer = optimizer(Arc::new(StaticProbe::from_mb(100, 1000)), None);
        for _ in 0..30 {
            optimizer.calculate_batch_size(&kilobyte_items(5), "store");
        }
        assert_eq!(optimizer.history().len(), 20);
        assert_eq!(optimizer.statistics().history_len, 20);
    }

    #[test]
    fn test_large_average_batch_recommendation() {
        let optimizer = optimizer(Arc::new(StaticProbe::from_mb(100, 1000)), None);
        for _ in 0..3 {
            optimizer.calculate_batch_size(&kilobyte_items(100), "chunking");
        }
        let recommendations = optimizer.recommendations();
        assert_eq!(recommendations.len(), 1);
        assert!(recommendations[0].contains("'chunking'"));
    }

    #[tokio::test]
    async fn test_optimized_process_fn_measures_memory() {
        let probe = Arc::new(StaticProbe::from_mb(100, 1000));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let hook: ReclaimHook = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let optimizer = optimizer(probe.clone(), Some(hook));

        let growing = probe.clone();
        let wrapped = optimizer.optimize_process_fn("embedding", move |items: Vec<u32>, _meta: ()| {
            let growing = growing.clone();
            async move {
                growing.set_used_mb(200);
                Ok(items.into_iter().map(|i| i * 2).collect::<Vec<_>>())
            }
        });

        let result = wrapped((0..10).collect(), ()).await.unwrap();
        assert_eq!(result, vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = optimizer.statistics();
        let embedding = stats
            .operations
            .iter()
            .find(|op| op.operation == "embedding")
            .unwrap();
        assert_eq!(embedding.measured_batches, 1);
        assert_eq!(embedding.average_bytes_per_item, Some(10.0 * MB as f64));

        assert!(
            optimizer
                .recommendations()
                .iter()
                .any(|r| r.contains("MB per item"))
        );
    }

    #[tokio::test]
    async fn test_optimized_process_fn_propagates_errors() {
        let optimizer = optimizer(Arc::new(StaticProbe::from_mb(100, 1000)), None);
        let wrapped = optimizer.optimize_process_fn("store", |_items: Vec<u8>, _meta: usize| async {
            Err::<(), _>(anyhow::anyhow!("store offline"))
        });
        let err = wrapped(vec![1, 2, 3], 0).await.unwrap_err();
        assert_eq!(err.to_string(), "store offline");
    }
}
