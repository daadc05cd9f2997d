//! # sift-ai-context
//!
//! Text splitting for the sift ingestion pipeline. See [`text`] for the available
//! strategies and their guarantees.

pub mod text;

// Re-export the splitter types for external use
pub use text::{SplitError, SplitStrategy, SplitterConfig, TextChunk, TextSplitter};
