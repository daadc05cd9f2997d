//! Memory awareness for batch work.
//!
//! - [`probe`]: where readings come from, and the optional reclamation hook
//! - [`size`]: per-item size estimates
//! - [`manager`]: batch sizing, active batch tracking, snapshots and trends
//! - [`heap`]: issue classification on top of the manager
//! - [`optimizer`]: aggressive sizing, decision history and per-operation accounting

pub mod heap;
pub mod manager;
pub mod optimizer;
pub mod probe;
pub mod size;

pub use heap::{HeapAnalysis, HeapAnalyzer, HeapAnalyzerConfig, HeapIssue, HeapIssueKind, HealthStatus, Severity};
pub use manager::{
    BatchSizeOptions, BatchTracker, MemoryManager, MemoryManagerConfig, MemorySnapshot,
    MemoryStatistics, MemoryTrend, MemoryUsage, TrendDirection, trend_from_snapshots,
};
pub use optimizer::{BatchOperationRecord, BatchOptimizer, BatchOptimizerConfig, OptimizerStatistics};
pub use probe::{MemoryProbe, MemoryReading, ReclaimHook, StaticProbe, SysinfoProbe};
pub use size::EstimateSize;
