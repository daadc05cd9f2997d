//! Standalone query decorator with its own freshness check.

use super::cache::QueryCache;
use super::manager::DbMemoryManager;
use crate::error::{IngestError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Options for [`DbMemoryManager::optimize_query`]
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Name used in cache keys and logs
    pub query_name: String,
    pub enable_cache: bool,
    /// Freshness window; the manager's cache TTL when unset
    pub cache_ttl: Option<Duration>,
}

impl QueryOptions {
    pub fn new(query_name: impl Into<String>) -> Self {
        Self {
            query_name: query_name.into(),
            enable_cache: true,
            cache_ttl: None,
        }
    }

    pub fn with_cache(mut self, enable_cache: bool) -> Self {
        self.enable_cache = enable_cache;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
}

/// Call counters of one optimized query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStats {
    pub calls: u64,
    pub hits: u64,
    pub executions: u64,
}

#[derive(Debug, Default)]
struct QueryCounters {
    calls: AtomicU64,
    hits: AtomicU64,
    executions: AtomicU64,
}

type CacheKeyFn<A> = Arc<dyn Fn(&A) -> Option<String> + Send + Sync>;

/// A query function wrapped with result caching and monitoring.
///
/// Cached results are re-validated against the freshness window on every lookup, so
/// a stale entry is never served even if no maintenance sweep has run yet.
pub struct OptimizedQuery<A, R, F> {
    manager: DbMemoryManager,
    query_fn: F,
    options: QueryOptions,
    cache_key_fn: Option<CacheKeyFn<A>>,
    counters: QueryCounters,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R, F, Fut> OptimizedQuery<A, R, F>
where
    A: Serialize,
    R: Serialize + DeserializeOwned,
    F: Fn(A) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    pub(crate) fn new(manager: DbMemoryManager, query_fn: F, options: QueryOptions) -> Self {
        Self {
            manager,
            query_fn,
            options,
            cache_key_fn: None,
            counters: QueryCounters::default(),
            _marker: PhantomData,
        }
    }

    /// Derive cache keys from the arguments instead of serializing them.
    /// Returning `None` skips the cache for that call.
    pub fn with_cache_key_fn(
        mut self,
        cache_key_fn: impl Fn(&A) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.cache_key_fn = Some(Arc::new(cache_key_fn));
        self
    }

    pub fn name(&self) -> &str {
        &self.options.query_name
    }

    fn cache_key(&self, args: &A) -> Option<String> {
        if !self.options.enable_cache {
            return None;
        }
        match &self.cache_key_fn {
            Some(key_fn) => {
                key_fn(args).map(|key| format!("{}:{key}", self.options.query_name))
            }
            None => QueryCache::key_for(&self.options.query_name, args),
        }
    }

    pub async fn call(&self, args: A) -> Result<R> {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);
        let name = self.options.query_name.as_str();
        let ttl = self
            .options
            .cache_ttl
            .unwrap_or_else(|| self.manager.config().cache_ttl());
        let key = self.cache_key(&args);

        if let Some(key) = &key {
            if let Some(value) = self.manager.cached::<R>(key, ttl) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(query = name, "Cache hit");
                return Ok(value);
            }
        }

        self.manager.count_query();
        self.counters.executions.fetch_add(1, Ordering::Relaxed);

        let measured = self
            .manager
            .measure(name, key.as_deref(), (self.query_fn)(args))
            .await;

        measured.result.map_err(|source| IngestError::Query {
            connection: "optimized".to_string(),
            method: name.to_string(),
            source,
        })
    }

    pub fn stats(&self) -> QueryStats {
        QueryStats {
            calls: self.counters.calls.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            executions: self.counters.executions.load(Ordering::Relaxed),
        }
    }
}
