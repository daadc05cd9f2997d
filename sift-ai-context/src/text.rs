//! Text splitting for document ingestion.
//!
//! Documents are turned into embeddable [`TextChunk`]s by a [`TextSplitter`]
//! configured with one of three [`SplitStrategy`] values:
//!
//! - [`SplitStrategy::Characters`]: a fixed-size character window that advances by
//!   `chunk_size - chunk_overlap` characters, so neighbouring chunks share context.
//! - [`SplitStrategy::Paragraphs`]: one chunk per blank-line separated paragraph.
//!   Paragraphs shorter than `min_chunk_size` are merged with the paragraphs that
//!   follow them; paragraphs longer than `chunk_size` fall back to the character window.
//! - [`SplitStrategy::Markdown`]: recursive splitting on markdown structure (headings,
//!   code fences, paragraphs, list items, lines, spaces), packing segments into chunks
//!   no larger than `chunk_size` bytes. Concatenating the chunks reproduces the input.
//!
//! # Example
//!
//! ```
//! use sift_ai_context::text::{SplitStrategy, SplitterConfig, TextSplitter};
//!
//! let config = SplitterConfig::new(SplitStrategy::Paragraphs)
//!     .with_chunk_size(500)
//!     .with_min_chunk_size(10);
//! let splitter = TextSplitter::new(config).unwrap();
//!
//! let chunks = splitter.split("First paragraph here.\n\nSecond paragraph here.");
//! assert_eq!(chunks.len(), 2);
//! assert_eq!(chunks[0].text, "First paragraph here.");
//! assert_eq!(chunks[1].sequence, 1);
//! ```
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Regular expression patterns for splitting Markdown content into logical segments.
///
/// These delimiters are ordered from most significant to least significant,
/// guiding the recursive splitting used by [`SplitStrategy::Markdown`].
///
/// - `(?m)^\s*#{1,6}\s+.*$`: Markdown headings (e.g., `# Heading`, `## Subheading`).
/// - ```` ``` ````: Markdown code block fences.
/// - `\n\n`: Double newlines, typically separating paragraphs.
/// - `(?m)^\s*[-*+]\s+`: Unordered list item markers.
/// - `(?m)^\s*\d+\.\s+`: Ordered list item markers.
/// - `\n`: Single newlines.
/// - ` `: Spaces, the most granular delimiter.
pub const MARKDOWN_DELIMITERS: &[&str] = &[
    r"(?m)^\s*#{1,6}\s+.*$", // Headings
    r"```",                  // Code block fences
    r"\n\n",                 // Paragraphs
    r"(?m)^\s*[-*+]\s+",     // Unordered list items
    r"(?m)^\s*\d+\.\s+",     // Ordered list items
    r"\n",                   // Line breaks
    r" ",                    // Spaces
];

/// Blank-line paragraph separator.
const PARAGRAPH_SEPARATOR: &str = r"\n[ \t]*\n\s*";

/// Errors raised while building a splitter.
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    /// A delimiter pattern failed to compile
    #[error("Invalid delimiter pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The sizes in the configuration are inconsistent
    #[error("Invalid splitter configuration: {message}")]
    InvalidConfig { message: String },
}

/// How text is divided into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitStrategy {
    /// Fixed character window with overlap
    #[default]
    Characters,
    /// Paragraph boundaries with a minimum chunk size
    Paragraphs,
    /// Markdown-structure-aware recursive splitting
    Markdown,
}

impl std::str::FromStr for SplitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "characters" | "chars" | "fixed" => Ok(Self::Characters),
            "paragraphs" | "paragraph" => Ok(Self::Paragraphs),
            "markdown" | "md" => Ok(Self::Markdown),
            _ => Err(format!("Invalid split strategy: {s}")),
        }
    }
}

/// Configuration for a [`TextSplitter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitterConfig {
    /// Splitting strategy
    pub strategy: SplitStrategy,
    /// Maximum chunk size (characters for the window strategies, bytes for markdown)
    pub chunk_size: usize,
    /// Characters shared between consecutive windows
    pub chunk_overlap: usize,
    /// Paragraphs shorter than this are merged with their successors
    pub min_chunk_size: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            strategy: SplitStrategy::Characters,
            chunk_size: 1000,
            chunk_overlap: 200,
            min_chunk_size: 50,
        }
    }
}

impl SplitterConfig {
    pub fn new(strategy: SplitStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_chunk_overlap(mut self, chunk_overlap: usize) -> Self {
        self.chunk_overlap = chunk_overlap;
        self
    }

    pub fn with_min_chunk_size(mut self, min_chunk_size: usize) -> Self {
        self.min_chunk_size = min_chunk_size;
        self
    }

    /// Check that the sizes describe a splitter that makes progress.
    pub fn validate(&self) -> Result<(), SplitError> {
        if self.chunk_size == 0 {
            return Err(SplitError::InvalidConfig {
                message: "chunk_size must be greater than zero".to_string(),
            });
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(SplitError::InvalidConfig {
                message: format!(
                    "chunk_overlap ({}) must be smaller than chunk_size ({})",
                    self.chunk_overlap, self.chunk_size
                ),
            });
        }
        Ok(())
    }
}

/// A single chunk of text extracted from a document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextChunk {
    /// The sequence number of this chunk within the document (0-indexed).
    pub sequence: usize,
    /// The text content of this chunk.
    pub text: String,
    /// Byte range in the source text covered by this chunk.
    pub start: usize,
    pub end: usize,
}

impl TextChunk {
    fn new(sequence: usize, text: String, span: Range<usize>) -> Self {
        Self {
            sequence,
            text,
            start: span.start,
            end: span.end,
        }
    }

    /// Length of the chunk text in characters.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Splits text according to a [`SplitterConfig`].
#[derive(Debug, Clone)]
pub struct TextSplitter {
    config: SplitterConfig,
    delimiters: Vec<Regex>,
    paragraph_separator: Regex,
}

impl TextSplitter {
    /// Create a splitter, validating the configuration and compiling the markdown delimiters.
    pub fn new(config: SplitterConfig) -> Result<Self, SplitError> {
        Self::with_delimiters(config, MARKDOWN_DELIMITERS)
    }

    /// Create a splitter whose markdown strategy uses custom delimiter patterns.
    ///
    /// Delimiters are applied in the order they appear, from most significant to least.
    pub fn with_delimiters(
        config: SplitterConfig,
        delimiter_patterns: &[&str],
    ) -> Result<Self, SplitError> {
        config.validate()?;

        let delimiters = delimiter_patterns
            .iter()
            .map(|&pattern| compile(pattern))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            config,
            delimiters,
            paragraph_separator: compile(PARAGRAPH_SEPARATOR)?,
        })
    }

    pub fn config(&self) -> &SplitterConfig {
        &self.config
    }

    /// Split `text` into chunks using the configured strategy.
    ///
    /// Empty or whitespace-only input produces no chunks.
    pub fn split(&self, text: &str) -> Vec<TextChunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        match self.config.strategy {
            SplitStrategy::Characters => {
                let mut chunks = Vec::new();
                self.push_windows(text, 0, &mut chunks);
                chunks
            }
            SplitStrategy::Paragraphs => self.split_paragraphs(text),
            SplitStrategy::Markdown => self.split_markdown(text),
        }
    }

    /// Append overlapping character windows over `text` to `chunks`.
    ///
    /// `base` is the byte offset of `text` within the original document.
    fn push_windows(&self, text: &str, base: usize, chunks: &mut Vec<TextChunk>) {
        let size = self.config.chunk_size;
        let step = size - self.config.chunk_overlap;

        // Byte offset of every char boundary, plus the end of the text.
        let mut boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        boundaries.push(text.len());
        let char_count = boundaries.len() - 1;

        let mut start_char = 0;
        loop {
            let end_char = (start_char + size).min(char_count);
            let (start, end) = (boundaries[start_char], boundaries[end_char]);
            let window = &text[start..end];
            if !window.trim().is_empty() {
                chunks.push(TextChunk::new(
                    chunks.len(),
                    window.to_string(),
                    base + start..base + end,
                ));
            }
            if end_char >= char_count {
                break;
            }
            start_char += step;
        }
    }

    fn split_paragraphs(&self, text: &str) -> Vec<TextChunk> {
        let mut chunks = Vec::new();
        let mut pending: Option<(String, Range<usize>)> = None;

        for span in self.paragraph_spans(text) {
            let paragraph = &text[span.clone()];

            let (merged, merged_span) = match pending.take() {
                Some((mut acc, acc_span)) => {
                    acc.push_str("\n\n");
                    acc.push_str(paragraph);
                    (acc, acc_span.start..span.end)
                }
                None => (paragraph.to_string(), span),
            };

            let len = merged.chars().count();
            if len < self.config.min_chunk_size {
                pending = Some((merged, merged_span));
            } else if len > self.config.chunk_size {
                self.push_windows(&merged, merged_span.start, &mut chunks);
            } else {
                chunks.push(TextChunk::new(chunks.len(), merged, merged_span));
            }
        }

        // A short tail joins the previous chunk when it still fits, otherwise stands alone.
        if let Some((tail, tail_span)) = pending {
            match chunks.last_mut() {
                Some(last)
                    if last.char_len() + 2 + tail.chars().count() <= self.config.chunk_size =>
                {
                    last.text.push_str("\n\n");
                    last.text.push_str(&tail);
                    last.end = tail_span.end;
                }
                _ => chunks.push(TextChunk::new(chunks.len(), tail, tail_span)),
            }
        }

        chunks
    }

    /// Byte ranges of the trimmed, non-empty paragraphs in `text`.
    fn paragraph_spans(&self, text: &str) -> Vec<Range<usize>> {
        let mut spans = Vec::new();
        let mut start = 0;
        let bounds = self
            .paragraph_separator
            .find_iter(text)
            .map(|m| (m.start(), m.end()))
            .chain(std::iter::once((text.len(), text.len())));

        for (sep_start, sep_end) in bounds {
            let raw = &text[start..sep_start];
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                let lead = raw.len() - raw.trim_start().len();
                spans.push(start + lead..start + lead + trimmed.len());
            }
            start = sep_end;
        }

        spans
    }

    fn split_markdown(&self, text: &str) -> Vec<TextChunk> {
        let max = self.config.chunk_size;
        let segments = self.split_recursively_into_segments(text, 0, 0);

        let mut chunks: Vec<TextChunk> = Vec::new();
        let mut current = 0..0;

        for segment in segments {
            // If adding the segment makes the chunk too large, emit the chunk and start anew.
            if current.end - current.start + segment.len() > max && !current.is_empty() {
                chunks.push(TextChunk::new(
                    chunks.len(),
                    text[current.clone()].to_string(),
                    current.clone(),
                ));
                current = segment;
            } else if current.is_empty() {
                current = segment;
            } else {
                current.end = segment.end;
            }
        }

        if !current.is_empty() {
            chunks.push(TextChunk::new(
                chunks.len(),
                text[current.clone()].to_string(),
                current,
            ));
        }

        chunks
    }

    // Recursively splits text into byte ranges that are either small enough to fit in a
    // chunk or are the delimiters themselves. Less significant delimiters are only tried
    // on pieces that are still too large.
    fn split_recursively_into_segments(
        &self,
        text: &str,
        delimiter_idx: usize,
        offset: usize,
    ) -> Vec<Range<usize>> {
        let max = self.config.chunk_size;
        let mut segments = Vec::new();

        if text.is_empty() {
            return segments;
        }

        if text.len() <= max {
            segments.push(offset..offset + text.len());
            return segments;
        }

        // Out of delimiters: cut on char boundaries at the size limit.
        let Some(delimiter) = self.delimiters.get(delimiter_idx) else {
            let mut local_start = 0;
            while local_start < text.len() {
                let mut local_end = (local_start + max).min(text.len());
                while !text.is_char_boundary(local_end) {
                    local_end += 1;
                }
                segments.push(offset + local_start..offset + local_end);
                local_start = local_end;
            }
            return segments;
        };

        let mut local_start = 0;
        for mat in delimiter.find_iter(text) {
            if mat.start() > local_start {
                segments.extend(self.split_recursively_into_segments(
                    &text[local_start..mat.start()],
                    delimiter_idx + 1,
                    offset + local_start,
                ));
            }
            if !mat.range().is_empty() {
                segments.push(offset + mat.start()..offset + mat.end());
            }
            local_start = mat.end();
        }

        if local_start < text.len() {
            segments.extend(self.split_recursively_into_segments(
                &text[local_start..],
                delimiter_idx + 1,
                offset + local_start,
            ));
        }

        segments
    }
}

fn compile(pattern: &str) -> Result<Regex, SplitError> {
    Regex::new(pattern).map_err(|source| SplitError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}
