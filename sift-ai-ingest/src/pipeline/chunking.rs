//! Chunking phase.

use super::document::{ChunkedDocument, Document, DocumentChunk};
use super::options::DocumentProcessingOptions;
use crate::batch::{BatchMeta, BatchProcessor, BatchRun, EventBus};
use crate::error::Result;
use crate::memory::BatchOptimizer;
use serde_json::Value;
use sift_ai_context::TextSplitter;
use std::sync::Arc;
use tracing::debug;

pub(crate) const CHUNKING_OPERATION: &str = "chunking";

/// Split `documents` into chunks, a few documents per batch.
///
/// Each result holds one document's chunks; documents that produce no text produce no
/// chunks but still appear in the results.
pub async fn batch_chunk_documents(
    documents: Vec<Document>,
    options: &DocumentProcessingOptions,
    optimizer: &BatchOptimizer,
) -> Result<BatchRun<ChunkedDocument>> {
    chunk_documents(documents, options, optimizer, EventBus::new()).await
}

pub(crate) async fn chunk_documents(
    documents: Vec<Document>,
    options: &DocumentProcessingOptions,
    optimizer: &BatchOptimizer,
    events: EventBus,
) -> Result<BatchRun<ChunkedDocument>> {
    options.validate()?;
    let splitter = Arc::new(TextSplitter::new(options.chunking.splitter_config())?);
    let include_metadata = options.chunking.include_metadata;

    let config = options.batching.processor_config(
        CHUNKING_OPERATION,
        options.batching.chunking_batch_size,
        options.batching.chunking_concurrency,
    );
    let processor = BatchProcessor::new(config)
        .with_optimizer(optimizer.clone())
        .with_event_bus(events);

    let chunk_fn = move |batch: Vec<Document>, _meta: BatchMeta| {
        let splitter = splitter.clone();
        async move {
            let mut chunked = Vec::with_capacity(batch.len());
            for document in batch {
                chunked.push(chunk_document(&splitter, document, include_metadata));
                tokio::task::yield_now().await;
            }
            Ok::<_, anyhow::Error>(chunked)
        }
    };

    processor
        .process(documents, optimizer.optimize_process_fn(CHUNKING_OPERATION, chunk_fn))
        .await
}

fn chunk_document(
    splitter: &TextSplitter,
    document: Document,
    include_metadata: bool,
) -> ChunkedDocument {
    let document_id = document.resolved_id();
    let pieces = splitter.split(&document.content);
    debug!(document_id = %document_id, chunks = pieces.len(), "Chunked document");

    let chunks = pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| {
            let chunk = DocumentChunk::new(&document_id, index, piece.text);
            if !include_metadata {
                return chunk;
            }
            let mut metadata = document.metadata.clone();
            metadata.insert("chunk_start".into(), Value::from(piece.start));
            metadata.insert("chunk_end".into(), Value::from(piece.end));
            chunk.with_metadata(metadata)
        })
        .collect();

    ChunkedDocument {
        document_id,
        chunks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BatchOptimizerConfig, MemoryManager, MemoryManagerConfig, StaticProbe};
    use sift_ai_context::SplitStrategy;

    fn optimizer() -> BatchOptimizer {
        let memory = MemoryManager::new(
            MemoryManagerConfig::default(),
            Arc::new(StaticProbe::from_mb(100, 1000)),
            None,
        );
        BatchOptimizer::new(memory, BatchOptimizerConfig::default())
    }

    #[tokio::test]
    async fn test_chunk_documents_in_batches() {
        let documents: Vec<Document> = (0..7)
            .map(|i| Document::new("x".repeat(250)).with_id(format!("doc-{i}")))
            .collect();
        let options = DocumentProcessingOptions::default().with_chunk_size(100, 20);

        let run = batch_chunk_documents(documents, &options, &optimizer())
            .await
            .unwrap();

        // 5 documents per batch by default
        assert_eq!(run.batch_count, 2);
        assert_eq!(run.results.len(), 7);
        assert_eq!(run.results[3].document_id, "doc-3");
        // 250 chars in windows of 100 stepping 80: 0..100, 80..180, 160..250
        assert_eq!(run.results[0].chunks.len(), 3);
        assert_eq!(run.results[0].chunks[1].id, "doc-0-chunk-1");
    }

    #[tokio::test]
    async fn test_metadata_is_carried() {
        let document = Document::new("# Title\n\nSome body text that is long enough.")
            .with_id("md")
            .with_metadata("source", "readme.md");
        let options = DocumentProcessingOptions::default()
            .with_strategy(SplitStrategy::Markdown)
            .with_chunk_size(500, 0);

        let run = batch_chunk_documents(vec![document.clone()], &options, &optimizer())
            .await
            .unwrap();
        let chunk = &run.results[0].chunks[0];
        assert_eq!(chunk.metadata["source"], "readme.md");
        assert!(chunk.metadata.contains_key("chunk_start"));

        let mut without = options.clone();
        without.chunking.include_metadata = false;
        let run = batch_chunk_documents(vec![document], &without, &optimizer())
            .await
            .unwrap();
        assert!(run.results[0].chunks[0].metadata.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_options_fail_before_work() {
        let options = DocumentProcessingOptions::default().with_chunk_size(10, 10);
        let err = batch_chunk_documents(vec![Document::new("text")], &options, &optimizer())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::IngestError::InvalidConfig { .. }));
    }
}
