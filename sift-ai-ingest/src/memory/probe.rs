//! Memory probes and the optional reclamation hook.
//!
//! The memory manager never reads process memory itself. It asks a [`MemoryProbe`],
//! which makes sizing decisions testable with scripted readings and lets deployments
//! choose what "heap" means for them (a fixed budget, a cgroup limit, the whole machine).

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sysinfo::{Pid, System};

/// Best-effort request to release memory (drop caches, trim allocator arenas, ...).
///
/// Purely a hint: callers must behave identically whether or not it frees anything.
pub type ReclaimHook = Arc<dyn Fn() + Send + Sync>;

/// A single raw memory reading in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryReading {
    /// Bytes in use by the managed working set
    pub heap_used: u64,
    /// Bytes the working set may grow to
    pub heap_total: u64,
    /// Resident set size of the process
    pub rss: u64,
}

impl MemoryReading {
    pub fn new(heap_used: u64, heap_total: u64, rss: u64) -> Self {
        Self {
            heap_used,
            heap_total,
            rss,
        }
    }

    /// heap_used / heap_total as a percentage; 0 when the total is unknown.
    pub fn utilization_pct(&self) -> f64 {
        if self.heap_total == 0 {
            return 0.0;
        }
        self.heap_used as f64 / self.heap_total as f64 * 100.0
    }
}

/// Source of memory readings.
pub trait MemoryProbe: Send + Sync {
    fn read(&self) -> MemoryReading;
}

/// Probe backed by `sysinfo`.
///
/// The process resident set is reported as both `heap_used` and `rss`; `heap_total` is
/// the configured budget, or the machine's total memory when no budget is set.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
    budget_bytes: Option<u64>,
}

impl std::fmt::Debug for SysinfoProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoProbe")
            .field("pid", &self.pid)
            .field("budget_bytes", &self.budget_bytes)
            .finish()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!("Unable to determine current pid, process memory unavailable: {e}");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
            budget_bytes: None,
        }
    }

    /// Measure utilization against a fixed budget instead of total system memory.
    pub fn with_budget(mut self, budget_bytes: u64) -> Self {
        self.budget_bytes = Some(budget_bytes);
        self
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn read(&self) -> MemoryReading {
        let mut system = self.system.lock();

        let rss = match self.pid {
            Some(pid) => {
                system.refresh_process(pid);
                system.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            None => 0,
        };

        let heap_total = match self.budget_bytes {
            Some(budget) => budget,
            None => {
                system.refresh_memory();
                system.total_memory()
            }
        };

        MemoryReading::new(rss, heap_total, rss)
    }
}

/// Probe that reports whatever reading it was last given.
///
/// Useful for tests and for hosts that already track their own memory accounting and
/// push it in.
#[derive(Debug, Default)]
pub struct StaticProbe {
    reading: Mutex<MemoryReading>,
}

impl StaticProbe {
    pub fn new(reading: MemoryReading) -> Self {
        Self {
            reading: Mutex::new(reading),
        }
    }

    /// Convenience constructor: `used_mb` of `total_mb` with rss equal to used.
    pub fn from_mb(used_mb: u64, total_mb: u64) -> Self {
        Self::new(MemoryReading::new(used_mb * MB, total_mb * MB, used_mb * MB))
    }

    pub fn set(&self, reading: MemoryReading) {
        *self.reading.lock() = reading;
    }

    /// Change only heap_used (and rss alongside it).
    pub fn set_used_mb(&self, used_mb: u64) {
        let mut reading = self.reading.lock();
        reading.heap_used = used_mb * MB;
        reading.rss = used_mb * MB;
    }
}

impl MemoryProbe for StaticProbe {
    fn read(&self) -> MemoryReading {
        *self.reading.lock()
    }
}

pub(crate) const MB: u64 = 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utilization() {
        assert_eq!(MemoryReading::new(50, 200, 60).utilization_pct(), 25.0);
        assert_eq!(MemoryReading::new(50, 0, 60).utilization_pct(), 0.0);
    }

    #[test]
    fn test_static_probe() {
        let probe = StaticProbe::from_mb(100, 400);
        assert_eq!(probe.read().utilization_pct(), 25.0);

        probe.set_used_mb(300);
        let reading = probe.read();
        assert_eq!(reading.heap_used, 300 * MB);
        assert_eq!(reading.rss, 300 * MB);
        assert_eq!(reading.utilization_pct(), 75.0);
    }

    #[test]
    fn test_sysinfo_probe_reads_something() {
        let probe = SysinfoProbe::new().with_budget(u64::MAX);
        let reading = probe.read();
        assert_eq!(reading.heap_total, u64::MAX);
        assert_eq!(reading.heap_used, reading.rss);
    }
}
