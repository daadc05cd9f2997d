//! Memory-aware batch sizing, active batch tracking and best-effort reclamation.

use super::probe::{MB, MemoryProbe, MemoryReading, ReclaimHook};
use super::size::{EstimateSize, sample_indices, sampled_average_bytes};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Items sampled when estimating the average item size of a collection
const SIZE_SAMPLES: usize = 10;
/// Items sampled when looking for very large documents in an embedding batch
const LARGE_DOCUMENT_SAMPLES: usize = 5;
/// Average item size above which batches never default to the ceiling
const LARGE_ITEM_BYTES: usize = 50 * 1024;
/// Embedding batches larger than this request reclamation when released
const EMBEDDING_RELEASE_RECLAIM_SIZE: usize = 5;
/// Rate of change (MB/min) below which memory is considered stable
const STABLE_RATE_MB_PER_MIN: f64 = 1.0;

/// Configuration for the [`MemoryManager`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryManagerConfig {
    /// Smallest batch size ever returned
    pub min_batch_size: usize,
    /// Largest batch size ever returned
    pub max_batch_size: usize,
    /// Memory footprint a single batch should aim for
    pub target_batch_size_mb: f64,
    /// Utilization at which monitoring triggers reclamation and embedding batches shrink to the minimum
    pub gc_threshold_pct: f64,
    /// Utilization at which the process is considered under memory pressure
    pub memory_pressure_threshold_pct: f64,
    /// Upper bound for embedding batches
    pub embedding_batch_limit: usize,
    /// Items larger than this halve the embedding batch size
    pub large_document_kb: usize,
    /// Reclaim automatically from `monitor_memory` when above `gc_threshold_pct`
    pub auto_gc: bool,
    /// Minimum time between two unforced reclamations
    pub gc_cooldown_ms: u64,
    /// Delay before the follow-up reclamation pass
    pub follow_up_gc_delay_ms: u64,
    /// Utilization above which a follow-up reclamation pass is scheduled
    pub follow_up_gc_threshold_pct: f64,
    /// Number of snapshots kept for trend analysis
    pub history_limit: usize,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 1,
            max_batch_size: 50,
            target_batch_size_mb: 10.0,
            gc_threshold_pct: 80.0,
            memory_pressure_threshold_pct: 80.0,
            embedding_batch_limit: 20,
            large_document_kb: 100,
            auto_gc: true,
            gc_cooldown_ms: 2_000,
            follow_up_gc_delay_ms: 1_000,
            follow_up_gc_threshold_pct: 75.0,
            history_limit: 100,
        }
    }
}

impl MemoryManagerConfig {
    pub fn with_batch_bounds(mut self, min_batch_size: usize, max_batch_size: usize) -> Self {
        self.min_batch_size = min_batch_size;
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_target_batch_size_mb(mut self, target_batch_size_mb: f64) -> Self {
        self.target_batch_size_mb = target_batch_size_mb;
        self
    }

    pub fn with_gc_threshold_pct(mut self, gc_threshold_pct: f64) -> Self {
        self.gc_threshold_pct = gc_threshold_pct;
        self
    }

    pub fn with_memory_pressure_threshold_pct(mut self, threshold_pct: f64) -> Self {
        self.memory_pressure_threshold_pct = threshold_pct;
        self
    }

    pub fn with_embedding_batch_limit(mut self, embedding_batch_limit: usize) -> Self {
        self.embedding_batch_limit = embedding_batch_limit;
        self
    }

    pub fn with_auto_gc(mut self, auto_gc: bool) -> Self {
        self.auto_gc = auto_gc;
        self
    }

    pub fn with_gc_cooldown(mut self, cooldown: Duration) -> Self {
        self.gc_cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    pub fn with_follow_up_gc_delay(mut self, delay: Duration) -> Self {
        self.follow_up_gc_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit;
        self
    }

    pub fn gc_cooldown(&self) -> Duration {
        Duration::from_millis(self.gc_cooldown_ms)
    }

    pub fn follow_up_gc_delay(&self) -> Duration {
        Duration::from_millis(self.follow_up_gc_delay_ms)
    }
}

/// Per-call overrides for batch sizing. Unset fields fall back to the manager config.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchSizeOptions {
    pub min_batch_size: Option<usize>,
    pub max_batch_size: Option<usize>,
    pub target_batch_size_mb: Option<f64>,
}

impl BatchSizeOptions {
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = Some(max_batch_size);
        self
    }

    pub fn with_min_batch_size(mut self, min_batch_size: usize) -> Self {
        self.min_batch_size = Some(min_batch_size);
        self
    }

    pub fn with_target_batch_size_mb(mut self, target_batch_size_mb: f64) -> Self {
        self.target_batch_size_mb = Some(target_batch_size_mb);
        self
    }
}

/// Current memory usage as seen by the manager
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub heap_used: u64,
    pub heap_total: u64,
    pub rss: u64,
    pub utilization_pct: f64,
    pub active_batches: usize,
}

impl MemoryUsage {
    pub fn heap_used_mb(&self) -> f64 {
        self.heap_used as f64 / MB as f64
    }
}

/// A timestamped memory reading kept in the manager's history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub timestamp: DateTime<Utc>,
    pub heap_used: u64,
    pub heap_total: u64,
    pub rss: u64,
    pub utilization_pct: f64,
}

impl MemorySnapshot {
    pub fn from_reading(reading: MemoryReading, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            heap_used: reading.heap_used,
            heap_total: reading.heap_total,
            rss: reading.rss,
            utilization_pct: reading.utilization_pct(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

/// Direction and rate of heap growth over a time window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryTrend {
    pub trend: TrendDirection,
    /// Heap growth in MB per minute (negative when shrinking)
    pub rate_mb_per_min: f64,
    /// Number of snapshots inside the window
    pub samples: usize,
}

impl MemoryTrend {
    fn stable(samples: usize) -> Self {
        Self {
            trend: TrendDirection::Stable,
            rate_mb_per_min: 0.0,
            samples,
        }
    }
}

/// Classify heap growth between the oldest and newest snapshot inside `window`.
///
/// Snapshots are expected in chronological order. Fewer than two samples, or samples
/// without elapsed time between them, are reported as stable.
pub fn trend_from_snapshots(
    snapshots: &[MemorySnapshot],
    window: Duration,
    now: DateTime<Utc>,
) -> MemoryTrend {
    let window =
        chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(365));
    let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
    let recent: Vec<&MemorySnapshot> = snapshots
        .iter()
        .filter(|s| s.timestamp >= cutoff)
        .collect();

    let (Some(oldest), Some(newest)) = (recent.first(), recent.last()) else {
        return MemoryTrend::stable(0);
    };
    if recent.len() < 2 {
        return MemoryTrend::stable(recent.len());
    }

    let elapsed_min = (newest.timestamp - oldest.timestamp).num_milliseconds() as f64 / 60_000.0;
    if elapsed_min <= 0.0 {
        return MemoryTrend::stable(recent.len());
    }

    let delta_mb = (newest.heap_used as f64 - oldest.heap_used as f64) / MB as f64;
    let rate = delta_mb / elapsed_min;
    let trend = if rate > STABLE_RATE_MB_PER_MIN {
        TrendDirection::Increasing
    } else if rate < -STABLE_RATE_MB_PER_MIN {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    };

    MemoryTrend {
        trend,
        rate_mb_per_min: rate,
        samples: recent.len(),
    }
}

/// Summary of the manager's state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStatistics {
    pub usage: MemoryUsage,
    pub under_pressure: bool,
    pub reclaim_available: bool,
    pub reclaim_count: u64,
    pub last_reclaim: Option<DateTime<Utc>>,
    pub history_len: usize,
}

#[derive(Debug, Default)]
struct ReclaimState {
    last_instant: Option<Instant>,
    last_at: Option<DateTime<Utc>>,
}

struct Inner {
    config: MemoryManagerConfig,
    probe: Arc<dyn MemoryProbe>,
    reclaim: Option<ReclaimHook>,
    active_batches: AtomicUsize,
    reclaim_count: AtomicU64,
    reclaim_state: Mutex<ReclaimState>,
    history: Mutex<VecDeque<MemorySnapshot>>,
}

/// Reads memory through a [`MemoryProbe`] and turns it into batch sizing decisions.
///
/// Cheap to clone; clones share counters, history and the reclamation cooldown.
#[derive(Clone)]
pub struct MemoryManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.inner.config)
            .field("active_batches", &self.active_batches())
            .field("reclaim_available", &self.inner.reclaim.is_some())
            .finish()
    }
}

impl MemoryManager {
    pub fn new(
        config: MemoryManagerConfig,
        probe: Arc<dyn MemoryProbe>,
        reclaim: Option<ReclaimHook>,
    ) -> Self {
        let history_limit = config.history_limit;
        Self {
            inner: Arc::new(Inner {
                config,
                probe,
                reclaim,
                active_batches: AtomicUsize::new(0),
                reclaim_count: AtomicU64::new(0),
                reclaim_state: Mutex::new(ReclaimState::default()),
                history: Mutex::new(VecDeque::with_capacity(history_limit)),
            }),
        }
    }

    pub fn config(&self) -> &MemoryManagerConfig {
        &self.inner.config
    }

    pub fn get_current_memory_usage(&self) -> MemoryUsage {
        let reading = self.inner.probe.read();
        MemoryUsage {
            heap_used: reading.heap_used,
            heap_total: reading.heap_total,
            rss: reading.rss,
            utilization_pct: reading.utilization_pct(),
            active_batches: self.active_batches(),
        }
    }

    pub fn utilization_pct(&self) -> f64 {
        self.inner.probe.read().utilization_pct()
    }

    pub fn active_batches(&self) -> usize {
        self.inner.active_batches.load(Ordering::SeqCst)
    }

    /// Batch size that keeps one batch of `items` near the target footprint.
    ///
    /// Up to ten evenly spaced items are sampled. The result is always within the
    /// configured bounds; an empty collection gets the maximum.
    pub fn calculate_optimal_batch_size<T: EstimateSize>(
        &self,
        items: &[T],
        options: &BatchSizeOptions,
    ) -> usize {
        let config = &self.inner.config;
        let max = options.max_batch_size.unwrap_or(config.max_batch_size).max(1);
        let min = options
            .min_batch_size
            .unwrap_or(config.min_batch_size)
            .clamp(1, max);
        let target_mb = options
            .target_batch_size_mb
            .unwrap_or(config.target_batch_size_mb);

        let Some(average) = sampled_average_bytes(items, SIZE_SAMPLES) else {
            return max;
        };
        let average = average.max(1);

        let target_bytes = (target_mb.max(0.0) * MB as f64) as usize;
        let mut size = (target_bytes / average).clamp(min, max);
        if average > LARGE_ITEM_BYTES && size == max {
            size = (max / 2).max(min);
        }

        debug!(
            items = items.len(),
            average_item_bytes = average,
            batch_size = size,
            "Calculated optimal batch size"
        );
        size
    }

    /// Batch size for embedding generation, which holds both text and vectors in memory.
    pub fn calculate_embedding_batch_size<T: EstimateSize>(&self, items: &[T]) -> usize {
        let config = &self.inner.config;
        let min = config.min_batch_size.max(1);
        let usage = self.get_current_memory_usage();

        if usage.utilization_pct > config.gc_threshold_pct {
            debug!(
                utilization_pct = usage.utilization_pct,
                "High memory utilization, using minimum embedding batch size"
            );
            return min;
        }

        let mut cap = config.max_batch_size.min(config.embedding_batch_limit).max(min);
        if usage.active_batches > 1 {
            cap = (cap / 2).max(min);
        }

        let large_bytes = config.large_document_kb * 1024;
        let has_large_document = sample_indices(items.len(), LARGE_DOCUMENT_SAMPLES)
            .any(|i| items[i].estimated_bytes() > large_bytes);
        if has_large_document {
            cap = (cap / 2).max(min);
        }

        self.calculate_optimal_batch_size(
            items,
            &BatchSizeOptions::default()
                .with_min_batch_size(min)
                .with_max_batch_size(cap),
        )
    }

    /// Register an in-flight batch. The counter is decremented when the tracker is
    /// released or dropped.
    pub fn track_batch(&self, kind: &str, size: usize) -> BatchTracker {
        let active = self.inner.active_batches.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(kind, size, active, "Batch started");
        BatchTracker {
            manager: self.clone(),
            kind: kind.to_string(),
            size,
            started: Instant::now(),
            released: false,
        }
    }

    fn finish_batch(&self, kind: &str, size: usize) {
        let previous = self
            .inner
            .active_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            })
            .unwrap_or(0);
        debug!(kind, size, active = previous.saturating_sub(1), "Batch finished");

        if kind == "embedding" && size > EMBEDDING_RELEASE_RECLAIM_SIZE {
            self.try_reclaim(false);
        }
    }

    /// Ask the reclamation hook to free memory.
    ///
    /// Returns whether the hook ran. Unforced requests are skipped inside the cooldown
    /// window. When utilization stays high afterwards, one follow-up pass is scheduled
    /// on the current tokio runtime.
    pub fn try_reclaim(&self, force: bool) -> bool {
        let Some(hook) = self.inner.reclaim.clone() else {
            return false;
        };

        {
            let mut state = self.inner.reclaim_state.lock();
            if !force
                && state
                    .last_instant
                    .is_some_and(|last| last.elapsed() < self.inner.config.gc_cooldown())
            {
                return false;
            }
            state.last_instant = Some(Instant::now());
            state.last_at = Some(Utc::now());
        }

        hook();
        self.inner.reclaim_count.fetch_add(1, Ordering::SeqCst);

        let utilization = self.utilization_pct();
        debug!(force, utilization_pct = utilization, "Reclamation requested");

        if utilization > self.inner.config.follow_up_gc_threshold_pct {
            self.schedule_follow_up(hook);
        }
        true
    }

    fn schedule_follow_up(&self, hook: ReclaimHook) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let manager = self.clone();
        let delay = self.inner.config.follow_up_gc_delay();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let utilization = manager.utilization_pct();
            if utilization > manager.inner.config.follow_up_gc_threshold_pct {
                debug!(utilization_pct = utilization, "Follow-up reclamation pass");
                hook();
                manager.inner.reclaim_count.fetch_add(1, Ordering::SeqCst);
                let mut state = manager.inner.reclaim_state.lock();
                state.last_instant = Some(Instant::now());
                state.last_at = Some(Utc::now());
            }
        });
    }

    /// Take a snapshot, keep it in the history and reclaim if memory is high.
    pub fn monitor_memory(&self, force_gc: bool) -> MemorySnapshot {
        let snapshot = MemorySnapshot::from_reading(self.inner.probe.read(), Utc::now());

        {
            let mut history = self.inner.history.lock();
            history.push_back(snapshot);
            while history.len() > self.inner.config.history_limit {
                history.pop_front();
            }
        }

        let config = &self.inner.config;
        if force_gc {
            self.try_reclaim(true);
        } else if config.auto_gc && snapshot.utilization_pct >= config.gc_threshold_pct {
            info!(
                utilization_pct = snapshot.utilization_pct,
                "Memory utilization above reclamation threshold"
            );
            self.try_reclaim(false);
        }

        snapshot
    }

    pub fn get_memory_trend(&self, window: Duration) -> MemoryTrend {
        let snapshots: Vec<MemorySnapshot> = self.inner.history.lock().iter().copied().collect();
        trend_from_snapshots(&snapshots, window, Utc::now())
    }

    pub fn history(&self) -> Vec<MemorySnapshot> {
        self.inner.history.lock().iter().copied().collect()
    }

    pub fn is_under_memory_pressure(&self) -> bool {
        let utilization = self.utilization_pct();
        let under_pressure = utilization >= self.inner.config.memory_pressure_threshold_pct;
        if under_pressure {
            warn!(utilization_pct = utilization, "Memory pressure detected");
        }
        under_pressure
    }

    pub fn reclaim_available(&self) -> bool {
        self.inner.reclaim.is_some()
    }

    pub fn statistics(&self) -> MemoryStatistics {
        let usage = self.get_current_memory_usage();
        MemoryStatistics {
            under_pressure: usage.utilization_pct
                >= self.inner.config.memory_pressure_threshold_pct,
            usage,
            reclaim_available: self.reclaim_available(),
            reclaim_count: self.inner.reclaim_count.load(Ordering::SeqCst),
            last_reclaim: self.inner.reclaim_state.lock().last_at,
            history_len: self.inner.history.lock().len(),
        }
    }
}

/// Guard for an in-flight batch created by [`MemoryManager::track_batch`].
#[derive(Debug)]
pub struct BatchTracker {
    manager: MemoryManager,
    kind: String,
    size: usize,
    started: Instant,
    released: bool,
}

impl BatchTracker {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Release the batch and return how long it was in flight.
    pub fn release(mut self) -> Duration {
        self.released = true;
        self.manager.finish_batch(&self.kind, self.size);
        self.started.elapsed()
    }
}

impl Drop for BatchTracker {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.manager.finish_batch(&self.kind, self.size);
        }
    }
}
