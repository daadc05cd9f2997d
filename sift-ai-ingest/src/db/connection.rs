//! Connection adapters and their monitored handles.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Adapter over a database connection (or any query-capable client).
///
/// Every data operation goes through `execute`, named by `method` with JSON arguments.
#[async_trait]
pub trait QueryConnection: Send + Sync {
    async fn execute(&self, method: &str, args: &Value) -> anyhow::Result<Value>;

    /// Whether results of `method` may be served from the cache.
    fn is_cacheable(&self, _method: &str) -> bool {
        true
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Active,
    Busy,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterOptions {
    /// Free-form connection type, e.g. "sqlite"
    pub kind: String,
    /// Primary connections are never closed for being idle
    pub is_primary: bool,
}

impl RegisterOptions {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            is_primary: false,
        }
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }
}

/// Snapshot of a registered connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub kind: String,
    pub is_primary: bool,
    pub state: ConnectionState,
    pub created: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub query_count: u64,
    pub total_query_time_ms: u64,
    pub active_queries: usize,
}

#[derive(Debug)]
struct ConnectionRecord {
    state: ConnectionState,
    created: DateTime<Utc>,
    last_active: DateTime<Utc>,
    last_active_at: Instant,
    query_count: u64,
    total_query_time: Duration,
    active_queries: usize,
}

pub(crate) struct ConnectionEntry {
    pub(crate) id: String,
    pub(crate) options: RegisterOptions,
    pub(crate) connection: Arc<dyn QueryConnection>,
    record: Mutex<ConnectionRecord>,
}

impl ConnectionEntry {
    pub(crate) fn new(
        id: String,
        options: RegisterOptions,
        connection: Arc<dyn QueryConnection>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            options,
            connection,
            record: Mutex::new(ConnectionRecord {
                state: ConnectionState::Idle,
                created: now,
                last_active: now,
                last_active_at: Instant::now(),
                query_count: 0,
                total_query_time: Duration::ZERO,
                active_queries: 0,
            }),
        }
    }

    fn touch(record: &mut ConnectionRecord) {
        record.last_active = Utc::now();
        record.last_active_at = Instant::now();
    }

    /// Count a query as in flight until the returned guard is finished or dropped.
    pub(crate) fn begin_query(self: &Arc<Self>) -> QueryGuard {
        let mut record = self.record.lock();
        record.query_count += 1;
        record.active_queries += 1;
        record.state = ConnectionState::Active;
        Self::touch(&mut record);
        QueryGuard {
            entry: Arc::clone(self),
            started: Instant::now(),
            finished: false,
        }
    }

    fn mark_executing(&self) {
        let mut record = self.record.lock();
        if record.state != ConnectionState::Closed {
            record.state = ConnectionState::Busy;
        }
    }

    fn end_query(&self, elapsed: Duration) {
        let mut record = self.record.lock();
        record.active_queries = record.active_queries.saturating_sub(1);
        record.total_query_time += elapsed;
        if record.state != ConnectionState::Closed {
            record.state = if record.active_queries == 0 {
                ConnectionState::Idle
            } else {
                ConnectionState::Busy
            };
        }
        Self::touch(&mut record);
    }

    /// Idle for longer than `timeout` with nothing in flight.
    pub(crate) fn is_evictable(&self, timeout: Duration) -> bool {
        if self.options.is_primary {
            return false;
        }
        let record = self.record.lock();
        record.active_queries == 0 && record.last_active_at.elapsed() > timeout
    }

    pub(crate) fn mark_closed(&self) {
        self.record.lock().state = ConnectionState::Closed;
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.record.lock().state
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        let record = self.record.lock();
        ConnectionInfo {
            id: self.id.clone(),
            kind: self.options.kind.clone(),
            is_primary: self.options.is_primary,
            state: record.state,
            created: record.created,
            last_active: record.last_active,
            query_count: record.query_count,
            total_query_time_ms: record.total_query_time.as_millis() as u64,
            active_queries: record.active_queries,
        }
    }
}

/// In-flight query on a [`ConnectionEntry`].
///
/// Dropping it unfinished (a cancelled caller) still releases the query.
pub(crate) struct QueryGuard {
    entry: Arc<ConnectionEntry>,
    started: Instant,
    finished: bool,
}

impl QueryGuard {
    pub(crate) fn mark_executing(&self) {
        self.entry.mark_executing();
    }

    pub(crate) fn finish(mut self, elapsed: Duration) {
        self.finished = true;
        self.entry.end_query(elapsed);
    }
}

impl Drop for QueryGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.entry.end_query(self.started.elapsed());
        }
    }
}
