//! Heap analysis: classify the current memory picture into issues and recommendations.

use super::manager::{MemoryManager, MemoryTrend, MemoryUsage, TrendDirection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapAnalyzerConfig {
    /// Growth rate (MB/min) above which an increasing trend is reported as a potential leak
    pub leak_rate_mb_per_min: f64,
    pub high_utilization_pct: f64,
    /// Utilization above which the analyzer reclaims proactively
    pub critical_utilization_pct: f64,
    /// rss / heap_total ratio above which non-heap memory is flagged
    pub external_memory_ratio: f64,
    pub trend_window_ms: u64,
}

impl Default for HeapAnalyzerConfig {
    fn default() -> Self {
        Self {
            leak_rate_mb_per_min: 5.0,
            high_utilization_pct: 85.0,
            critical_utilization_pct: 90.0,
            external_memory_ratio: 1.5,
            trend_window_ms: 5 * 60 * 1000,
        }
    }
}

impl HeapAnalyzerConfig {
    pub fn with_leak_rate_mb_per_min(mut self, rate: f64) -> Self {
        self.leak_rate_mb_per_min = rate;
        self
    }

    pub fn with_high_utilization_pct(mut self, pct: f64) -> Self {
        self.high_utilization_pct = pct;
        self
    }

    pub fn trend_window(&self) -> Duration {
        Duration::from_millis(self.trend_window_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeapIssueKind {
    PotentialLeak,
    HighUtilization,
    ExternalMemory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeapIssue {
    pub kind: HeapIssueKind,
    pub severity: Severity,
    pub message: String,
}

/// Overall health, taken from the most severe issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn from_issues(issues: &[HeapIssue]) -> Self {
        match issues.iter().map(|i| i.severity).max() {
            None => HealthStatus::Healthy,
            Some(Severity::High) => HealthStatus::Critical,
            Some(_) => HealthStatus::Warning,
        }
    }
}

/// Result of [`HeapAnalyzer::analyze_heap`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapAnalysis {
    pub timestamp: DateTime<Utc>,
    pub usage: MemoryUsage,
    pub trend: MemoryTrend,
    pub status: HealthStatus,
    pub issues: Vec<HeapIssue>,
    pub recommendations: Vec<String>,
    /// Whether the analysis triggered a reclamation pass
    pub reclaimed: bool,
}

/// Findings derived from one usage reading and trend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeapFindings {
    pub issues: Vec<HeapIssue>,
    pub recommendations: Vec<String>,
    pub reclaim: bool,
}

/// Classify a usage reading and trend without touching any state.
pub fn classify(
    usage: &MemoryUsage,
    trend: &MemoryTrend,
    config: &HeapAnalyzerConfig,
) -> HeapFindings {
    let mut findings = HeapFindings::default();

    if trend.trend == TrendDirection::Increasing
        && trend.rate_mb_per_min > config.leak_rate_mb_per_min
    {
        findings.issues.push(HeapIssue {
            kind: HeapIssueKind::PotentialLeak,
            severity: Severity::High,
            message: format!(
                "Heap is growing at {:.2} MB/min over {} samples",
                trend.rate_mb_per_min, trend.samples
            ),
        });
        findings.recommendations.push(
            "Investigate allocations that outlive their batch: cached results, retained chunk vectors or unreleased batch trackers".to_string(),
        );
    }

    if usage.utilization_pct > config.high_utilization_pct {
        findings.issues.push(HeapIssue {
            kind: HeapIssueKind::HighUtilization,
            severity: Severity::Medium,
            message: format!("Heap utilization is {:.1}%", usage.utilization_pct),
        });
        findings
            .recommendations
            .push("Reduce batch sizes or enable aggressive batch optimization".to_string());

        if usage.utilization_pct > config.critical_utilization_pct {
            findings.reclaim = true;
            findings.recommendations.push(
                "Triggered memory reclamation because utilization exceeded the critical threshold"
                    .to_string(),
            );
        }
    }

    let external_limit = usage.heap_total as f64 * config.external_memory_ratio;
    if usage.heap_total > 0 && usage.rss as f64 > external_limit {
        findings.issues.push(HeapIssue {
            kind: HeapIssueKind::ExternalMemory,
            severity: Severity::Low,
            message: format!(
                "Resident set ({} bytes) exceeds {:.1}x the heap total ({} bytes)",
                usage.rss, config.external_memory_ratio, usage.heap_total
            ),
        });
        findings.recommendations.push(
            "Check native buffers and memory-mapped data held outside the managed heap".to_string(),
        );
    }

    findings
}

/// Read-and-classify layer over a [`MemoryManager`].
#[derive(Debug, Clone)]
pub struct HeapAnalyzer {
    memory: MemoryManager,
    config: HeapAnalyzerConfig,
}

impl HeapAnalyzer {
    pub fn new(memory: MemoryManager, config: HeapAnalyzerConfig) -> Self {
        Self { memory, config }
    }

    pub fn config(&self) -> &HeapAnalyzerConfig {
        &self.config
    }

    pub fn analyze_heap(&self) -> HeapAnalysis {
        let usage = self.memory.get_current_memory_usage();
        let trend = self.memory.get_memory_trend(self.config.trend_window());
        let findings = classify(&usage, &trend, &self.config);

        let reclaimed = findings.reclaim && self.memory.try_reclaim(true);
        for issue in &findings.issues {
            match issue.severity {
                Severity::High => warn!(kind = ?issue.kind, "{}", issue.message),
                _ => info!(kind = ?issue.kind, "{}", issue.message),
            }
        }

        HeapAnalysis {
            timestamp: Utc::now(),
            usage,
            trend,
            status: HealthStatus::from_issues(&findings.issues),
            issues: findings.issues,
            recommendations: findings.recommendations,
            reclaimed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::manager::MemoryManagerConfig;
    use crate::memory::probe::{MB, MemoryReading, ReclaimHook, StaticProbe};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn usage(used_mb: u64, total_mb: u64, rss_mb: u64) -> MemoryUsage {
        let reading = MemoryReading::new(used_mb * MB, total_mb * MB, rss_mb * MB);
        MemoryUsage {
            heap_used: reading.heap_used,
            heap_total: reading.heap_total,
            rss: reading.rss,
            utilization_pct: reading.utilization_pct(),
            active_batches: 0,
        }
    }

    fn trend(direction: TrendDirection, rate: f64) -> MemoryTrend {
        MemoryTrend {
            trend: direction,
            rate_mb_per_min: rate,
            samples: 4,
        }
    }

    #[test]
    fn test_healthy_heap_has_no_issues() {
        let findings = classify(
            &usage(100, 1000, 120),
            &trend(TrendDirection::Stable, 0.2),
            &HeapAnalyzerConfig::default(),
        );
        assert!(findings.issues.is_empty());
        assert!(findings.recommendations.is_empty());
        assert!(!findings.reclaim);
        assert_eq!(HealthStatus::from_issues(&findings.issues), HealthStatus::Healthy);
    }

    #[test]
    fn test_leak_detection() {
        let config = HeapAnalyzerConfig::default();
        let findings = classify(
            &usage(100, 1000, 100),
            &trend(TrendDirection::Increasing, 8.0),
            &config,
        );
        assert_eq!(findings.issues.len(), 1);
        assert_eq!(findings.issues[0].kind, HeapIssueKind::PotentialLeak);
        assert_eq!(findings.issues[0].severity, Severity::High);
        assert_eq!(HealthStatus::from_issues(&findings.issues), HealthStatus::Critical);

        let slow = classify(
            &usage(100, 1000, 100),
            &trend(TrendDirection::Increasing, 3.0),
            &config,
        );
        assert!(slow.issues.is_empty());
    }

    #[test]
    fn test_high_and_critical_utilization() {
        let config = HeapAnalyzerConfig::default();
        let stable = trend(TrendDirection::Stable, 0.0);
        let high = classify(&usage(870, 1000, 870), &stable, &config);
        assert_eq!(high.issues[0].kind, HeapIssueKind::HighUtilization);
        assert_eq!(high.issues[0].severity, Severity::Medium);
        assert!(!high.reclaim);

        let critical = classify(&usage(950, 1000, 950), &stable, &config);
        assert!(critical.reclaim);
        assert_eq!(critical.recommendations.len(), 2);
    }

    #[test]
    fn test_external_memory() {
        let findings = classify(
            &usage(100, 200, 400),
            &trend(TrendDirection::Stable, 0.0),
            &HeapAnalyzerConfig::default(),
        );
        let kinds: Vec<HeapIssueKind> = findings.issues.iter().map(|i| i.kind).collect();
        assert!(kinds.contains(&HeapIssueKind::ExternalMemory));
        assert_eq!(HealthStatus::from_issues(&findings.issues), HealthStatus::Warning);
    }

    #[test]
    fn test_analyze_heap_reclaims_when_critical() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let hook: ReclaimHook = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let manager = MemoryManager::new(
            MemoryManagerConfig::default(),
            Arc::new(StaticProbe::from_mb(950, 1000)),
            Some(hook),
        );
        let analyzer = HeapAnalyzer::new(manager, HeapAnalyzerConfig::default());

        let analysis = analyzer.analyze_heap();
        assert!(analysis.reclaimed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(analysis.status, HealthStatus::Warning);
        assert_eq!(analysis.trend.trend, TrendDirection::Stable);
    }
}
