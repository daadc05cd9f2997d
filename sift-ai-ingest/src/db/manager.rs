//! Database memory manager: monitored connections, a shared result cache and a
//! periodic maintenance sweep.

use super::cache::{CacheInsert, FALLBACK_RESULT_BYTES, QueryCache, estimate_result_bytes};
use super::connection::{
    ConnectionEntry, ConnectionInfo, ConnectionState, QueryConnection, RegisterOptions,
};
use super::query::{OptimizedQuery, QueryOptions};
use crate::error::{IngestError, Result};
use crate::memory::probe::MB;
use crate::memory::{HeapAnalyzer, HeapIssueKind, MemoryManager, MemoryUsage, Severity};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Interval between background maintenance sweeps
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbMemoryConfig {
    /// Connections considered a full pool when computing utilization
    pub max_connections: usize,
    pub idle_timeout_ms: u64,
    pub cache_ttl_ms: u64,
    pub max_cache_items: usize,
    pub max_cache_bytes: usize,
    /// Results above this size are logged
    pub large_result_bytes: usize,
    /// Results above this size also force a reclamation pass
    pub huge_result_bytes: usize,
    /// Utilization above which maintenance drops the whole cache
    pub clear_cache_utilization_pct: f64,
    pub slow_query_ms: u64,
    /// Hit ratio under which caching is flagged once `min_queries_for_hit_ratio` ran
    pub low_hit_ratio: f64,
    pub min_queries_for_hit_ratio: u64,
    /// Busy share of `max_connections` above which the pool is flagged
    pub high_connection_utilization: f64,
}

impl Default for DbMemoryConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout_ms: 5 * 60 * 1000,
            cache_ttl_ms: 15 * 60 * 1000,
            max_cache_items: 1000,
            max_cache_bytes: 50 * MB as usize,
            large_result_bytes: 5 * MB as usize,
            huge_result_bytes: 20 * MB as usize,
            clear_cache_utilization_pct: 85.0,
            slow_query_ms: 1000,
            low_hit_ratio: 0.3,
            min_queries_for_hit_ratio: 100,
            high_connection_utilization: 0.8,
        }
    }
}

impl DbMemoryConfig {
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_cache_limits(mut self, max_items: usize, max_bytes: usize) -> Self {
        self.max_cache_items = max_items;
        self.max_cache_bytes = max_bytes;
        self
    }

    pub fn with_result_thresholds(mut self, large_bytes: usize, huge_bytes: usize) -> Self {
        self.large_result_bytes = large_bytes;
        self.huge_result_bytes = huge_bytes;
        self
    }

    pub fn with_slow_query(mut self, threshold: Duration) -> Self {
        self.slow_query_ms = threshold.as_millis() as u64;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn slow_query(&self) -> Duration {
        Duration::from_millis(self.slow_query_ms)
    }
}

#[derive(Debug, Default)]
struct DbCounters {
    total_queries: u64,
    cache_hits: u64,
    cache_misses: u64,
    uncacheable: u64,
    failed_queries: u64,
    total_query_time: Duration,
    executed_queries: u64,
    slow_queries: u64,
    large_results: u64,
    huge_results: u64,
    closed_connections: u64,
    evictions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStatistics {
    pub connections: usize,
    pub active_connections: usize,
    pub busy_connections: usize,
    pub idle_connections: usize,
    pub closed_connections: u64,
    pub total_queries: u64,
    pub failed_queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub uncacheable_queries: u64,
    pub cache_hit_ratio: f64,
    pub cache_entries: usize,
    pub cache_bytes: usize,
    pub cache_evictions: u64,
    pub average_query_ms: f64,
    pub slow_queries: u64,
    pub large_results: u64,
    pub huge_results: u64,
    pub memory: MemoryUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIssueKind {
    LowCacheHitRatio,
    HighConnectionUtilization,
    LargeResults,
    SlowQueries,
    Heap(HeapIssueKind),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryIssue {
    pub kind: QueryIssueKind,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPerformanceAnalysis {
    pub statistics: DbStatistics,
    pub issues: Vec<QueryIssue>,
    pub recommendations: Vec<String>,
}

/// What one maintenance sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub closed_connections: Vec<String>,
    pub expired_entries: usize,
    pub cache_cleared: bool,
    pub cleared_entries: usize,
}

struct Inner {
    config: DbMemoryConfig,
    memory: MemoryManager,
    heap: HeapAnalyzer,
    connections: RwLock<HashMap<String, Arc<ConnectionEntry>>>,
    cache: Mutex<QueryCache>,
    counters: Mutex<DbCounters>,
    shutdown: Notify,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Tracks query activity and memory cost across registered connections.
///
/// Cheap to clone; clones share the registry, cache and statistics.
#[derive(Clone)]
pub struct DbMemoryManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DbMemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbMemoryManager")
            .field("config", &self.inner.config)
            .field("connections", &self.inner.connections.read().len())
            .field("cache_entries", &self.inner.cache.lock().len())
            .finish()
    }
}

impl DbMemoryManager {
    pub fn new(config: DbMemoryConfig, memory: MemoryManager, heap: HeapAnalyzer) -> Self {
        let cache = QueryCache::new(config.max_cache_items, config.max_cache_bytes);
        Self {
            inner: Arc::new(Inner {
                config,
                memory,
                heap,
                connections: RwLock::new(HashMap::new()),
                cache: Mutex::new(cache),
                counters: Mutex::new(DbCounters::default()),
                shutdown: Notify::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &DbMemoryConfig {
        &self.inner.config
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.inner.memory
    }

    /// Start the background maintenance sweep. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let manager = self.clone();
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = manager.run_maintenance().await;
                        debug!(?report, "Database maintenance sweep finished");
                    }
                    _ = manager.inner.shutdown.notified() => {
                        debug!("Database maintenance sweep stopping");
                        break;
                    }
                }
            }
        }));
        info!("Started database maintenance sweep every {:?}", SWEEP_INTERVAL);
    }

    pub fn is_running(&self) -> bool {
        self.inner.sweeper.lock().is_some()
    }

    /// Stop the sweep, close every registered connection and drop the cache.
    pub async fn shutdown(&self) {
        let handle = self.inner.sweeper.lock().take();
        if let Some(handle) = handle {
            self.inner.shutdown.notify_one();
            if let Err(e) = handle.await {
                error!("Database maintenance task failed: {e}");
            }
        }

        let entries: Vec<Arc<ConnectionEntry>> =
            self.inner.connections.write().drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            self.close_entry(&entry).await;
        }

        let cleared = self.inner.cache.lock().clear();
        info!(cleared_entries = cleared, "Database memory manager shut down");
    }

    async fn close_entry(&self, entry: &ConnectionEntry) {
        entry.mark_closed();
        match entry.connection.close().await {
            Ok(()) => debug!(connection = %entry.id, "Closed connection"),
            Err(e) => error!(connection = %entry.id, "Error closing connection: {e:#}"),
        }
        self.inner.counters.lock().closed_connections += 1;
    }

    /// Register a connection and get a monitored handle to it.
    pub fn register_connection<C>(
        &self,
        id: impl Into<String>,
        connection: C,
        options: RegisterOptions,
    ) -> Result<MonitoredConnection>
    where
        C: QueryConnection + 'static,
    {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(IngestError::invalid_input("connection id must not be empty"));
        }

        let entry = Arc::new(ConnectionEntry::new(id.clone(), options, Arc::new(connection)));
        let mut connections = self.inner.connections.write();
        if connections.insert(id.clone(), entry).is_some() {
            warn!(connection = %id, "Replaced an already registered connection");
        }
        if connections.len() > self.inner.config.max_connections {
            warn!(
                connections = connections.len(),
                max_connections = self.inner.config.max_connections,
                "More connections registered than the configured maximum"
            );
        }
        debug!(connection = %id, "Registered connection");

        Ok(MonitoredConnection {
            id,
            manager: self.clone(),
        })
    }

    /// Remove a connection and close it.
    pub async fn unregister_connection(&self, id: &str) -> Result<()> {
        let entry = self.inner.connections.write().remove(id);
        match entry {
            Some(entry) => {
                self.close_entry(&entry).await;
                Ok(())
            }
            None => Err(IngestError::UnknownConnection { id: id.to_string() }),
        }
    }

    pub fn connection_info(&self, id: &str) -> Option<ConnectionInfo> {
        self.inner.connections.read().get(id).map(|entry| entry.info())
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .inner
            .connections
            .read()
            .values()
            .map(|entry| entry.info())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    fn entry(&self, id: &str) -> Result<Arc<ConnectionEntry>> {
        self.inner
            .connections
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| IngestError::UnknownConnection { id: id.to_string() })
    }

    async fn execute_monitored(&self, id: &str, method: &str, args: &Value) -> Result<Value> {
        let entry = self.entry(id)?;
        let query = entry.begin_query();
        self.inner.counters.lock().total_queries += 1;

        let cache_key = if entry.connection.is_cacheable(method) {
            QueryCache::key_for(method, args)
        } else {
            None
        };

        if let Some(key) = &cache_key {
            let cached = self.inner.cache.lock().get(key, None);
            if let Some(value) = cached {
                self.inner.counters.lock().cache_hits += 1;
                query.finish(Duration::ZERO);
                debug!(connection = %id, method, "Cache hit");
                return Ok(value);
            }
        }

        query.mark_executing();
        let outcome = self
            .measure(method, cache_key.as_deref(), entry.connection.execute(method, args))
            .await;
        query.finish(outcome.elapsed);

        outcome.result.map_err(|source| IngestError::Query {
            connection: id.to_string(),
            method: method.to_string(),
            source,
        })
    }

    /// Run a query future with timing, memory accounting and caching of its result.
    pub(crate) async fn measure<T, Fut>(
        &self,
        label: &str,
        cache_key: Option<&str>,
        query: Fut,
    ) -> MeasuredQuery<T>
    where
        T: Serialize,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        {
            let mut counters = self.inner.counters.lock();
            if cache_key.is_some() {
                counters.cache_misses += 1;
            } else {
                counters.uncacheable += 1;
            }
        }

        let heap_before = self.inner.memory.get_current_memory_usage().heap_used;
        let started = Instant::now();
        let result = query.await;
        let elapsed = started.elapsed();
        let heap_after = self.inner.memory.get_current_memory_usage().heap_used;

        let mut counters = self.inner.counters.lock();
        counters.executed_queries += 1;
        counters.total_query_time += elapsed;

        if elapsed > self.inner.config.slow_query() {
            counters.slow_queries += 1;
            warn!(query = label, elapsed_ms = elapsed.as_millis() as u64, "Slow query");
        }

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                counters.failed_queries += 1;
                return MeasuredQuery {
                    result: Err(e),
                    elapsed,
                };
            }
        };

        // An unserializable result is still returned, just never cached
        let encoded = serde_json::to_value(&value).ok();
        let bytes = encoded
            .as_ref()
            .map_or(FALLBACK_RESULT_BYTES, estimate_result_bytes);
        let mut reclaim = false;
        if bytes > self.inner.config.large_result_bytes {
            counters.large_results += 1;
            warn!(
                query = label,
                result_mb = bytes as f64 / MB as f64,
                heap_delta_mb = (heap_after as f64 - heap_before as f64) / MB as f64,
                "Large query result"
            );
            if bytes > self.inner.config.huge_result_bytes {
                counters.huge_results += 1;
                reclaim = true;
            }
        }
        drop(counters);

        if reclaim {
            self.inner.memory.try_reclaim(true);
        }

        if let (Some(key), Some(encoded)) = (cache_key, encoded) {
            let inserted = self
                .inner
                .cache
                .lock()
                .insert(key.to_string(), encoded, bytes);
            match inserted {
                CacheInsert::Stored { evicted } if evicted > 0 => {
                    self.inner.counters.lock().evictions += evicted as u64;
                }
                CacheInsert::TooLarge => {
                    debug!(query = label, bytes, "Result too large to cache");
                }
                CacheInsert::Stored { .. } => {}
            }
        }

        MeasuredQuery {
            result: Ok(value),
            elapsed,
        }
    }

    /// Cache lookup with an explicit freshness check, counting the hit.
    /// Fresh cached value for `key`, decoded as `R`. Only a decoded value counts as a hit.
    pub(crate) fn cached<R: DeserializeOwned>(&self, key: &str, ttl: Duration) -> Option<R> {
        let cached = self.inner.cache.lock().get(key, Some(ttl))?;
        let value = match serde_json::from_value::<R>(cached) {
            Ok(value) => value,
            Err(e) => {
                debug!(key, "Ignoring undecodable cached result: {e}");
                return None;
            }
        };
        let mut counters = self.inner.counters.lock();
        counters.total_queries += 1;
        counters.cache_hits += 1;
        Some(value)
    }

    pub(crate) fn count_query(&self) {
        self.inner.counters.lock().total_queries += 1;
    }

    /// Wrap a standalone query function with caching and monitoring.
    pub fn optimize_query<A, R, F, Fut>(
        &self,
        query_fn: F,
        options: QueryOptions,
    ) -> OptimizedQuery<A, R, F>
    where
        A: Serialize,
        R: Serialize + DeserializeOwned,
        F: Fn(A) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        OptimizedQuery::new(self.clone(), query_fn, options)
    }

    /// One maintenance pass: close idle connections, expire cache entries, and drop
    /// the whole cache when memory utilization is high.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let config = &self.inner.config;
        let idle_timeout = config.idle_timeout();

        let idle: Vec<Arc<ConnectionEntry>> = {
            let mut connections = self.inner.connections.write();
            let ids: Vec<String> = connections
                .values()
                .filter(|entry| entry.is_evictable(idle_timeout))
                .map(|entry| entry.id.clone())
                .collect();
            ids.iter().filter_map(|id| connections.remove(id)).collect()
        };

        let mut report = MaintenanceReport::default();
        for entry in idle {
            info!(connection = %entry.id, "Closing idle connection");
            self.close_entry(&entry).await;
            report.closed_connections.push(entry.id.clone());
        }

        report.expired_entries = self.inner.cache.lock().purge_expired(config.cache_ttl());

        let utilization = self.inner.memory.utilization_pct();
        if utilization > config.clear_cache_utilization_pct {
            report.cleared_entries = self.inner.cache.lock().clear();
            report.cache_cleared = true;
            warn!(
                utilization_pct = utilization,
                cleared_entries = report.cleared_entries,
                "High memory utilization, cleared query cache"
            );
            self.inner.memory.try_reclaim(true);
        }

        report
    }

    pub fn clear_cache(&self) -> usize {
        self.inner.cache.lock().clear()
    }

    pub fn statistics(&self) -> DbStatistics {
        let (active, busy, idle, total) = {
            let connections = self.inner.connections.read();
            let mut active = 0;
            let mut busy = 0;
            let mut idle = 0;
            for entry in connections.values() {
                match entry.state() {
                    ConnectionState::Active => active += 1,
                    ConnectionState::Busy => busy += 1,
                    ConnectionState::Idle => idle += 1,
                    ConnectionState::Closed => {}
                }
            }
            (active, busy, idle, connections.len())
        };
        let (cache_entries, cache_bytes) = {
            let cache = self.inner.cache.lock();
            (cache.len(), cache.total_bytes())
        };
        let counters = self.inner.counters.lock();

        let lookups = counters.cache_hits + counters.cache_misses;
        DbStatistics {
            connections: total,
            active_connections: active,
            busy_connections: busy,
            idle_connections: idle,
            closed_connections: counters.closed_connections,
            total_queries: counters.total_queries,
            failed_queries: counters.failed_queries,
            cache_hits: counters.cache_hits,
            cache_misses: counters.cache_misses,
            uncacheable_queries: counters.uncacheable,
            cache_hit_ratio: if lookups > 0 {
                counters.cache_hits as f64 / lookups as f64
            } else {
                0.0
            },
            cache_entries,
            cache_bytes,
            cache_evictions: counters.evictions,
            average_query_ms: if counters.executed_queries > 0 {
                counters.total_query_time.as_secs_f64() * 1000.0 / counters.executed_queries as f64
            } else {
                0.0
            },
            slow_queries: counters.slow_queries,
            large_results: counters.large_results,
            huge_results: counters.huge_results,
            memory: self.inner.memory.get_current_memory_usage(),
        }
    }

    pub fn analyze_query_performance(&self) -> QueryPerformanceAnalysis {
        let statistics = self.statistics();
        let config = &self.inner.config;
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        if statistics.total_queries > config.min_queries_for_hit_ratio
            && statistics.cache_hit_ratio < config.low_hit_ratio
        {
            issues.push(QueryIssue {
                kind: QueryIssueKind::LowCacheHitRatio,
                severity: Severity::Medium,
                message: format!(
                    "Cache hit ratio is {:.1}% over {} queries",
                    statistics.cache_hit_ratio * 100.0,
                    statistics.total_queries
                ),
            });
            recommendations.push(
                "Review which queries are cached; repeated queries with unstable arguments never hit".to_string(),
            );
        }

        let utilization =
            statistics.busy_connections as f64 / config.max_connections.max(1) as f64;
        if utilization > config.high_connection_utilization {
            issues.push(QueryIssue {
                kind: QueryIssueKind::HighConnectionUtilization,
                severity: Severity::Medium,
                message: format!(
                    "{} of {} connections are busy",
                    statistics.busy_connections, config.max_connections
                ),
            });
            recommendations.push(
                "Increase the connection pool size or throttle concurrent queries".to_string(),
            );
        }

        if statistics.large_results > 0 {
            issues.push(QueryIssue {
                kind: QueryIssueKind::LargeResults,
                severity: Severity::Low,
                message: format!("{} queries returned large results", statistics.large_results),
            });
            recommendations
                .push("Paginate or stream queries that return large results".to_string());
        }

        if statistics.slow_queries > 0 {
            issues.push(QueryIssue {
                kind: QueryIssueKind::SlowQueries,
                severity: Severity::Low,
                message: format!(
                    "{} queries took longer than {} ms",
                    statistics.slow_queries, config.slow_query_ms
                ),
            });
            recommendations.push("Add indexes or narrow the slow queries".to_string());
        }

        let heap = self.inner.heap.analyze_heap();
        issues.extend(heap.issues.into_iter().map(|issue| QueryIssue {
            kind: QueryIssueKind::Heap(issue.kind),
            severity: issue.severity,
            message: issue.message,
        }));
        recommendations.extend(heap.recommendations);

        QueryPerformanceAnalysis {
            statistics,
            issues,
            recommendations,
        }
    }
}

pub(crate) struct MeasuredQuery<T> {
    pub(crate) result: anyhow::Result<T>,
    pub(crate) elapsed: Duration,
}

/// Handle to a registered connection. All calls are monitored and cached.
#[derive(Debug, Clone)]
pub struct MonitoredConnection {
    id: String,
    manager: DbMemoryManager,
}

impl MonitoredConnection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn execute(&self, method: &str, args: &Value) -> Result<Value> {
        self.manager.execute_monitored(&self.id, method, args).await
    }

    pub fn info(&self) -> Option<ConnectionInfo> {
        self.manager.connection_info(&self.id)
    }
}
