//! Generic batch processing with progress events.

pub mod events;
pub mod processor;

pub use events::{BatchEvent, EventBus};
pub use processor::{
    BatchFailure, BatchMeta, BatchProcessor, BatchProcessorConfig, BatchRun, process_in_batches,
};
