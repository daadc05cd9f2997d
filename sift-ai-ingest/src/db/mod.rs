//! Database memory management.
//!
//! Connections are registered through the [`QueryConnection`] adapter trait and used
//! through [`MonitoredConnection`] handles. Every call is counted, timed and sized;
//! results are cached under `method:args` keys with item, byte and age limits. A
//! background sweep closes idle connections and expires cache entries.

pub mod cache;
pub mod connection;
pub mod manager;
pub mod query;

pub use cache::{QueryCache, estimate_result_bytes};
pub use connection::{ConnectionInfo, ConnectionState, QueryConnection, RegisterOptions};
pub use manager::{
    DbMemoryConfig, DbMemoryManager, DbStatistics, MaintenanceReport, MonitoredConnection,
    QueryIssue, QueryIssueKind, QueryPerformanceAnalysis, SWEEP_INTERVAL,
};
pub use query::{OptimizedQuery, QueryOptions, QueryStats};
