//! Progress events emitted by the batch processor.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    BatchStart {
        operation: String,
        batch_index: usize,
        start: usize,
        end: usize,
        total_items: usize,
    },
    BatchComplete {
        operation: String,
        batch_index: usize,
        items: usize,
        /// Fraction of all items whose batch has finished, in 0.0..=1.0
        progress: f64,
        elapsed: Duration,
    },
    BatchFailed {
        operation: String,
        batch_index: usize,
        start: usize,
        end: usize,
        error: String,
    },
    /// Emitted exactly once per run, including runs aborted by fail-fast
    ProcessingComplete {
        operation: String,
        batch_count: usize,
        processed_items: usize,
        failed_batches: usize,
        elapsed: Duration,
    },
}

impl BatchEvent {
    pub fn operation(&self) -> &str {
        match self {
            BatchEvent::BatchStart { operation, .. }
            | BatchEvent::BatchComplete { operation, .. }
            | BatchEvent::BatchFailed { operation, .. }
            | BatchEvent::ProcessingComplete { operation, .. } => operation,
        }
    }
}

/// Fan-out of events to any number of subscribers.
///
/// Subscribers whose receiver was dropped are removed on the next emit.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<flume::Sender<BatchEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> flume::Receiver<BatchEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: BatchEvent) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
