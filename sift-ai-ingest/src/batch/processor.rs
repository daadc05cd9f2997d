//! Generic batch processor.
//!
//! Items are split into batches and handed to a caller-supplied async function.
//! Up to `concurrency` batches run at once; each group is awaited before the next one
//! is sized and dispatched. Results always come back in submission order.

use super::events::{BatchEvent, EventBus};
use crate::error::{IngestError, Result};
use crate::memory::{BatchOptimizer, EstimateSize};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchProcessorConfig {
    pub batch_size: usize,
    /// Maximum number of batches in flight at once
    pub concurrency: usize,
    /// Size each group of batches through the optimizer instead of using `batch_size`
    pub dynamic_batch_size: bool,
    pub delay_between_batches_ms: u64,
    /// Abort the run on the first failed batch
    pub fail_fast: bool,
    /// Take a memory snapshot after every group of batches
    pub monitor_memory: bool,
    /// Name used for events, logs and optimizer records
    pub operation: String,
}

impl Default for BatchProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 1,
            dynamic_batch_size: false,
            delay_between_batches_ms: 0,
            fail_fast: false,
            monitor_memory: false,
            operation: "batch".to_string(),
        }
    }
}

impl BatchProcessorConfig {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_dynamic_batch_size(mut self, dynamic: bool) -> Self {
        self.dynamic_batch_size = dynamic;
        self
    }

    pub fn with_delay_between_batches(mut self, delay: Duration) -> Self {
        self.delay_between_batches_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_monitor_memory(mut self, monitor_memory: bool) -> Self {
        self.monitor_memory = monitor_memory;
        self
    }

    pub fn delay_between_batches(&self) -> Duration {
        Duration::from_millis(self.delay_between_batches_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(IngestError::invalid_config("batch_size must be greater than 0"));
        }
        if self.concurrency == 0 {
            return Err(IngestError::invalid_config("concurrency must be greater than 0"));
        }
        Ok(())
    }
}

/// Position of a batch within its run, passed to the process function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchMeta {
    pub batch_index: usize,
    /// Index of the first item of the batch in the input
    pub start: usize,
    /// One past the last item of the batch
    pub end: usize,
    pub total_items: usize,
}

impl BatchMeta {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A batch that failed without aborting the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub start: usize,
    pub end: usize,
    pub error: String,
}

/// Outcome of [`BatchProcessor::process`]
#[derive(Debug, Clone)]
pub struct BatchRun<R> {
    /// Results of the successful batches, in submission order
    pub results: Vec<R>,
    pub failures: Vec<BatchFailure>,
    pub batch_count: usize,
    /// Items in batches that succeeded
    pub processed_items: usize,
    pub elapsed: Duration,
}

impl<R> BatchRun<R> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn map_results<U>(self, f: impl FnOnce(Vec<R>) -> Vec<U>) -> BatchRun<U> {
        BatchRun {
            results: f(self.results),
            failures: self.failures,
            batch_count: self.batch_count,
            processed_items: self.processed_items,
            elapsed: self.elapsed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchProcessor {
    config: BatchProcessorConfig,
    optimizer: Option<BatchOptimizer>,
    events: EventBus,
}

impl BatchProcessor {
    pub fn new(config: BatchProcessorConfig) -> Self {
        Self {
            config,
            optimizer: None,
            events: EventBus::new(),
        }
    }

    /// Attach an optimizer, used for dynamic sizing and memory monitoring.
    pub fn with_optimizer(mut self, optimizer: BatchOptimizer) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    /// Publish events on an existing bus, shared with other processors.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &BatchProcessorConfig {
        &self.config
    }

    /// Receive events for every subsequent run of this processor.
    pub fn subscribe(&self) -> flume::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    fn next_batch_size<T: EstimateSize>(&self, pending: &[T]) -> usize {
        match (&self.optimizer, self.config.dynamic_batch_size) {
            (Some(optimizer), true) => optimizer.calculate_batch_size(pending, &self.config.operation),
            _ => self.config.batch_size,
        }
    }

    /// Run `process_fn` over `items` in batches.
    ///
    /// A failing batch is recorded in [`BatchRun::failures`] and the run continues,
    /// unless fail-fast is enabled, in which case the first failure (in submission order)
    /// is returned as [`IngestError::BatchAborted`] once its group has finished.
    pub async fn process<T, R, F, Fut>(&self, items: Vec<T>, process_fn: F) -> Result<BatchRun<R>>
    where
        T: EstimateSize,
        F: Fn(Vec<T>, BatchMeta) -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<R>>>,
    {
        self.config.validate()?;
        if self.config.dynamic_batch_size && self.optimizer.is_none() {
            warn!(
                operation = %self.config.operation,
                "Dynamic batch sizing requested without an optimizer, using fixed batch size"
            );
        }
        if self.config.monitor_memory && self.optimizer.is_none() {
            warn!(
                operation = %self.config.operation,
                "Memory monitoring requested without an optimizer, skipping memory snapshots"
            );
        }

        let started = Instant::now();
        let operation = self.config.operation.clone();
        let total_items = items.len();
        let mut pending: VecDeque<T> = items.into();

        let mut results = Vec::new();
        let mut failures = Vec::new();
        let mut batch_count = 0;
        let mut processed_items = 0;
        let mut offset = 0;

        debug!(operation = %operation, total_items, "Starting batch processing");

        while !pending.is_empty() {
            let batch_size = self.next_batch_size(pending.make_contiguous()).max(1);

            let mut group = Vec::with_capacity(self.config.concurrency);
            for _ in 0..self.config.concurrency {
                if pending.is_empty() {
                    break;
                }
                let take = batch_size.min(pending.len());
                let batch: Vec<T> = pending.drain(..take).collect();
                let meta = BatchMeta {
                    batch_index: batch_count,
                    start: offset,
                    end: offset + take,
                    total_items,
                };
                offset += take;
                batch_count += 1;

                self.events.emit(BatchEvent::BatchStart {
                    operation: operation.clone(),
                    batch_index: meta.batch_index,
                    start: meta.start,
                    end: meta.end,
                    total_items,
                });
                debug!(
                    operation = %operation,
                    batch_index = meta.batch_index,
                    batch_size = take,
                    "Dispatching batch"
                );

                let future = process_fn(batch, meta.clone());
                group.push(async move {
                    let batch_started = Instant::now();
                    let outcome = future.await;
                    (meta, outcome, batch_started.elapsed())
                });
            }

            let mut abort = None;
            let mut group_failures = 0;
            for (meta, outcome, elapsed) in join_all(group).await {
                match outcome {
                    Ok(values) => {
                        processed_items += meta.len();
                        results.extend(values);
                        self.events.emit(BatchEvent::BatchComplete {
                            operation: operation.clone(),
                            batch_index: meta.batch_index,
                            items: meta.len(),
                            progress: meta.end as f64 / total_items as f64,
                            elapsed,
                        });
                    }
                    Err(error) => {
                        group_failures += 1;
                        warn!(
                            operation = %operation,
                            batch_index = meta.batch_index,
                            "Batch failed: {error:#}"
                        );
                        self.events.emit(BatchEvent::BatchFailed {
                            operation: operation.clone(),
                            batch_index: meta.batch_index,
                            start: meta.start,
                            end: meta.end,
                            error: format!("{error:#}"),
                        });
                        if self.config.fail_fast {
                            if abort.is_none() {
                                abort = Some((meta, error));
                            }
                        } else {
                            failures.push(BatchFailure {
                                batch_index: meta.batch_index,
                                start: meta.start,
                                end: meta.end,
                                error: format!("{error:#}"),
                            });
                        }
                    }
                }
            }

            if let Some((meta, source)) = abort {
                self.events.emit(BatchEvent::ProcessingComplete {
                    operation: operation.clone(),
                    batch_count,
                    processed_items,
                    failed_batches: group_failures,
                    elapsed: started.elapsed(),
                });
                return Err(IngestError::BatchAborted {
                    batch_index: meta.batch_index,
                    start: meta.start,
                    end: meta.end,
                    source,
                });
            }

            if self.config.monitor_memory {
                if let Some(optimizer) = &self.optimizer {
                    optimizer.memory().monitor_memory(false);
                }
            }

            let delay = self.config.delay_between_batches();
            if !delay.is_zero() && !pending.is_empty() {
                tokio::time::sleep(delay).await;
            }
        }

        let elapsed = started.elapsed();
        self.events.emit(BatchEvent::ProcessingComplete {
            operation: operation.clone(),
            batch_count,
            processed_items,
            failed_batches: failures.len(),
            elapsed,
        });
        info!(
            operation = %operation,
            batch_count,
            processed_items,
            failed_batches = failures.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Batch processing complete"
        );

        Ok(BatchRun {
            results,
            failures,
            batch_count,
            processed_items,
            elapsed,
        })
    }
}

/// One-off batch run without keeping a processor around.
pub async fn process_in_batches<T, R, F, Fut>(
    items: Vec<T>,
    process_fn: F,
    config: BatchProcessorConfig,
) -> Result<BatchRun<R>>
where
    T: EstimateSize,
    F: Fn(Vec<T>, BatchMeta) -> Fut,
    Fut: Future<Output = anyhow::Result<Vec<R>>>,
{
    BatchProcessor::new(config).process(items, process_fn).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        BatchOptimizerConfig, MemoryManager, MemoryManagerConfig, StaticProbe,
    };
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    fn doubling(
        calls: Arc<AtomicUsize>,
    ) -> impl Fn(Vec<i32>, BatchMeta) -> futures::future::Ready<anyhow::Result<Vec<i32>>> {
        move |batch, _meta| {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(batch.into_iter().map(|x| x * 2).collect()))
        }
    }

    #[tokio::test]
    async fn test_batch_count_and_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let run = process_in_batches(
            vec![1, 2, 3, 4, 5],
            doubling(calls.clone()),
            BatchProcessorConfig::default().with_batch_size(2),
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(run.results, vec![2, 4, 6, 8, 10]);
        assert_eq!(run.batch_count, 3);
        assert_eq!(run.processed_items, 5);
        assert!(run.is_complete());
    }

    #[tokio::test]
    async fn test_batch_sizes_passed_to_process_fn() {
        let sizes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = sizes.clone();
        process_in_batches(
            vec![1, 2, 3, 4, 5],
            move |batch: Vec<i32>, meta| {
                seen.lock().push((batch.len(), meta.start, meta.end));
                async move { Ok::<_, anyhow::Error>(Vec::<i32>::new()) }
            },
            BatchProcessorConfig::default().with_batch_size(2),
        )
        .await
        .unwrap();

        assert_eq!(*sizes.lock(), vec![(2, 0, 2), (2, 2, 4), (1, 4, 5)]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_fail_soft_skips_failed_batch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let run = process_in_batches(
            vec![1, 2, 3, 4, 5],
            move |batch: Vec<i32>, meta: BatchMeta| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if meta.batch_index == 1 {
                        anyhow::bail!("batch {} exploded", meta.batch_index);
                    }
                    Ok(batch.into_iter().map(|x| x * 2).collect::<Vec<_>>())
                }
            },
            BatchProcessorConfig::default().with_batch_size(2),
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(run.results, vec![2, 4, 10]);
        assert_eq!(run.processed_items, 3);
        assert_eq!(run.failures.len(), 1);
        assert_eq!(run.failures[0].batch_index, 1);
        assert_eq!((run.failures[0].start, run.failures[0].end), (2, 4));
        assert!(run.failures[0].error.contains("exploded"));
        assert!(logs_contain("Batch failed"));
    }

    #[tokio::test]
    async fn test_fail_fast_aborts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let processor = BatchProcessor::new(
            BatchProcessorConfig::new("strict")
                .with_batch_size(2)
                .with_fail_fast(true),
        );
        let events = processor.subscribe();

        let err = processor
            .process(vec![1, 2, 3, 4, 5], move |batch: Vec<i32>, meta: BatchMeta| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if meta.batch_index == 1 {
                        anyhow::bail!("bad batch");
                    }
                    Ok(batch)
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match err {
            IngestError::BatchAborted {
                batch_index,
                start,
                end,
                ..
            } => assert_eq!((batch_index, start, end), (1, 2, 4)),
            other => panic!("unexpected error: {other}"),
        }

        let events: Vec<BatchEvent> = events.try_iter().collect();
        let completions = events
            .iter()
            .filter(|e| matches!(e, BatchEvent::ProcessingComplete { .. }))
            .count();
        assert_eq!(completions, 1);
        assert!(matches!(events.last(), Some(BatchEvent::ProcessingComplete { .. })));
    }

    #[tokio::test]
    async fn test_fail_fast_counts_every_failure_in_group() {
        let processor = BatchProcessor::new(
            BatchProcessorConfig::new("strict")
                .with_batch_size(2)
                .with_concurrency(3)
                .with_fail_fast(true),
        );
        let events = processor.subscribe();

        let err = processor
            .process(vec![1, 2, 3, 4, 5, 6], |batch: Vec<i32>, meta: BatchMeta| async move {
                if meta.batch_index > 0 {
                    anyhow::bail!("bad batch {}", meta.batch_index);
                }
                Ok(batch)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::BatchAborted { batch_index: 1, .. }));

        let summary = events.try_iter().find_map(|event| match event {
            BatchEvent::ProcessingComplete {
                processed_items,
                failed_batches,
                ..
            } => Some((processed_items, failed_batches)),
            _ => None,
        });
        assert_eq!(summary, Some((2, 2)));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_monitoring_without_optimizer_is_logged() {
        let run = process_in_batches(
            vec![1, 2, 3],
            doubling(Arc::new(AtomicUsize::new(0))),
            BatchProcessorConfig::new("unmonitored").with_monitor_memory(true),
        )
        .await
        .unwrap();

        assert_eq!(run.results, vec![2, 4, 6]);
        assert!(logs_contain("Memory monitoring requested without an optimizer"));
    }

    #[tokio::test]
    async fn test_concurrent_results_keep_submission_order() {
        let run = process_in_batches(
            (0..12).collect::<Vec<u64>>(),
            |batch: Vec<u64>, meta: BatchMeta| async move {
                // Earlier batches finish last
                let delay = 40 - (meta.batch_index as u64 % 4) * 10;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok::<_, anyhow::Error>(batch)
            },
            BatchProcessorConfig::default()
                .with_batch_size(3)
                .with_concurrency(4),
        )
        .await
        .unwrap();

        assert_eq!(run.results, (0..12).collect::<Vec<u64>>());
        assert_eq!(run.batch_count, 4);
    }

    #[tokio::test]
    async fn test_concurrency_bounds_in_flight_batches() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current, max_seen) = (in_flight.clone(), peak.clone());

        process_in_batches(
            (0..20).collect::<Vec<u32>>(),
            move |batch: Vec<u32>, _meta| {
                let current = current.clone();
                let max_seen = max_seen.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(batch)
                }
            },
            BatchProcessorConfig::default()
                .with_batch_size(2)
                .with_concurrency(3),
        )
        .await
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let processor = BatchProcessor::new(BatchProcessorConfig::default());
        let events = processor.subscribe();
        let run = processor
            .process(Vec::<String>::new(), |batch: Vec<String>, _meta| async move {
                Ok::<_, anyhow::Error>(batch)
            })
            .await
            .unwrap();

        assert_eq!(run.batch_count, 0);
        assert!(run.results.is_empty());
        let events: Vec<BatchEvent> = events.try_iter().collect();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_work() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = process_in_batches(
            vec![1, 2, 3],
            doubling(calls.clone()),
            BatchProcessorConfig::default().with_batch_size(0),
        )
        .await;
        assert!(matches!(result, Err(IngestError::InvalidConfig { .. })));

        let result = process_in_batches(
            vec![1, 2, 3],
            doubling(calls.clone()),
            BatchProcessorConfig::default().with_concurrency(0),
        )
        .await;
        assert!(matches!(result, Err(IngestError::InvalidConfig { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dynamic_sizing_and_monitoring() {
        let memory = MemoryManager::new(
            MemoryManagerConfig::default().with_batch_bounds(1, 4),
            Arc::new(StaticProbe::from_mb(100, 1000)),
            None,
        );
        let optimizer = BatchOptimizer::new(memory.clone(), BatchOptimizerConfig::default());
        let processor = BatchProcessor::new(
            BatchProcessorConfig::new("dynamic")
                .with_batch_size(100)
                .with_dynamic_batch_size(true)
                .with_monitor_memory(true),
        )
        .with_optimizer(optimizer.clone());

        let items: Vec<String> = (0..10).map(|i| format!("item {i}")).collect();
        let run = processor
            .process(items, |batch: Vec<String>, _meta| async move {
                Ok::<_, anyhow::Error>(vec![batch.len()])
            })
            .await
            .unwrap();

        assert_eq!(run.results, vec![4, 4, 2]);
        assert_eq!(memory.history().len(), 3);
        assert!(optimizer.history().iter().all(|r| r.operation == "dynamic"));
    }
}
