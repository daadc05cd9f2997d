//! End-to-end document processing: chunk, embed, and optionally store.

use super::chunking::chunk_documents;
use super::document::{Document, DocumentChunk, EmbeddedChunk};
use super::embedding::generate_embeddings;
use super::options::DocumentProcessingOptions;
use crate::batch::{BatchEvent, BatchMeta, BatchProcessor, BatchRun, EventBus};
use crate::error::Result;
use crate::memory::BatchOptimizer;
use crate::store::{ChunkStore, StoreReceipt};
use serde::Serialize;
use sift_ai_embed::EmbeddingProvider;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Average document size above which a run is escalated
pub const LARGE_AVERAGE_DOCUMENT_BYTES: usize = 50 * 1024;
/// Corpus size above which a run is escalated
pub const LARGE_CORPUS_BYTES: usize = 1024 * 1024;

pub(crate) const STORE_OPERATION: &str = "store";

/// Summary of a [`DocumentProcessor::process_documents`] run.
///
/// Without a store the embedded chunks are returned in `embeddings`; with a store they
/// are handed over batch by batch and only the receipts come back.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingOutcome {
    pub document_count: usize,
    pub chunk_count: usize,
    pub embedding_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<Vec<EmbeddedChunk>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_results: Option<Vec<StoreReceipt>>,
    /// Failed batches across all phases
    pub failed_batches: usize,
    /// Zero-filled embeddings substituted for timed out requests
    pub degraded_embeddings: usize,
    /// Dynamic sizing and memory monitoring were forced on for this run
    pub escalated: bool,
    pub elapsed_ms: u64,
}

/// Whether a corpus is large enough to force dynamic sizing and monitoring.
pub fn needs_escalation(documents: &[Document]) -> bool {
    if documents.is_empty() {
        return false;
    }
    let total: usize = documents.iter().map(|d| d.content.len()).sum();
    total / documents.len() > LARGE_AVERAGE_DOCUMENT_BYTES || total > LARGE_CORPUS_BYTES
}

/// Runs documents through chunking, embedding and storage.
#[derive(Clone)]
pub struct DocumentProcessor {
    provider: Arc<dyn EmbeddingProvider>,
    optimizer: BatchOptimizer,
    options: DocumentProcessingOptions,
    events: EventBus,
}

impl std::fmt::Debug for DocumentProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentProcessor")
            .field("provider", &self.provider.provider_name())
            .field("options", &self.options)
            .finish()
    }
}

impl DocumentProcessor {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        optimizer: BatchOptimizer,
        options: DocumentProcessingOptions,
    ) -> Self {
        Self {
            provider,
            optimizer,
            options,
            events: EventBus::new(),
        }
    }

    pub fn options(&self) -> &DocumentProcessingOptions {
        &self.options
    }

    pub fn optimizer(&self) -> &BatchOptimizer {
        &self.optimizer
    }

    /// Batch events of every phase of every run.
    pub fn subscribe(&self) -> flume::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    /// Process `documents` with this processor's options.
    pub async fn process_documents(
        &self,
        documents: Vec<Document>,
        store: Option<Arc<dyn ChunkStore>>,
    ) -> Result<ProcessingOutcome> {
        self.process_documents_with(documents, &self.options, store)
            .await
    }

    /// Process `documents` with explicit options.
    pub async fn process_documents_with(
        &self,
        documents: Vec<Document>,
        options: &DocumentProcessingOptions,
        store: Option<Arc<dyn ChunkStore>>,
    ) -> Result<ProcessingOutcome> {
        options.validate()?;
        let started = Instant::now();

        let mut options = options.clone();
        let escalated = needs_escalation(&documents);
        if escalated {
            info!(
                documents = documents.len(),
                "Large corpus, enabling dynamic batch sizing and memory monitoring"
            );
            options.batching.dynamic_batch_size = true;
            options.batching.monitor_memory = true;
        }

        let document_count = documents.len();
        let chunked = chunk_documents(documents, &options, &self.optimizer, self.events.clone())
            .await?;
        let mut failed_batches = chunked.failures.len();

        let chunks: Vec<DocumentChunk> = chunked
            .results
            .into_iter()
            .flat_map(|document| document.chunks)
            .collect();
        let chunk_count = chunks.len();
        info!(document_count, chunk_count, "Chunking phase complete");

        let embedded = generate_embeddings(
            chunks,
            self.provider.clone(),
            &options,
            &self.optimizer,
            self.events.clone(),
        )
        .await?;
        failed_batches += embedded.run.failures.len();
        let degraded_embeddings = embedded.degraded;
        let embeddings = embedded.run.results;
        let embedding_count = embeddings.len();
        info!(embedding_count, degraded_embeddings, "Embedding phase complete");

        let (embeddings, store_results) = match store {
            Some(store) => {
                let stored = self.store_embeddings(embeddings, &options, store).await?;
                failed_batches += stored.failures.len();
                (None, Some(stored.results))
            }
            None => (Some(embeddings), None),
        };

        let elapsed = started.elapsed();
        info!(
            document_count,
            chunk_count,
            embedding_count,
            failed_batches,
            escalated,
            elapsed_ms = elapsed.as_millis() as u64,
            "Document processing complete"
        );

        Ok(ProcessingOutcome {
            document_count,
            chunk_count,
            embedding_count,
            embeddings,
            store_results,
            failed_batches,
            degraded_embeddings,
            escalated,
            elapsed_ms: elapsed.as_millis() as u64,
        })
    }

    async fn store_embeddings(
        &self,
        embeddings: Vec<EmbeddedChunk>,
        options: &DocumentProcessingOptions,
        store: Arc<dyn ChunkStore>,
    ) -> Result<BatchRun<StoreReceipt>> {
        let config = options.batching.processor_config(
            STORE_OPERATION,
            options.batching.store_batch_size,
            options.batching.store_concurrency,
        );
        let processor = BatchProcessor::new(config)
            .with_optimizer(self.optimizer.clone())
            .with_event_bus(self.events.clone());

        let store_fn = move |batch: Vec<EmbeddedChunk>, _meta: BatchMeta| {
            let store = store.clone();
            async move {
                let receipt = store.store_chunks(batch).await?;
                Ok::<_, anyhow::Error>(vec![receipt])
            }
        };

        processor
            .process(
                embeddings,
                self.optimizer.optimize_process_fn(STORE_OPERATION, store_fn),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BatchOptimizerConfig, MemoryManager, MemoryManagerConfig, StaticProbe};
    use crate::store::InMemoryChunkStore;
    use sift_ai_context::SplitStrategy;
    use sift_ai_embed::{EmbedConfig, HashEmbedProvider};

    fn processor(options: DocumentProcessingOptions) -> DocumentProcessor {
        let memory = MemoryManager::new(
            MemoryManagerConfig::default(),
            Arc::new(StaticProbe::from_mb(100, 1000)),
            None,
        );
        let provider =
            Arc::new(HashEmbedProvider::new(EmbedConfig::default().with_dimension(32)).unwrap());
        DocumentProcessor::new(
            provider,
            BatchOptimizer::new(memory, BatchOptimizerConfig::default()),
            options,
        )
    }

    fn paragraphs(n: usize) -> String {
        (0..n)
            .map(|i| format!("Paragraph {i} talks about memory aware batching in some detail."))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[test]
    fn test_needs_escalation() {
        assert!(!needs_escalation(&[]));
        assert!(!needs_escalation(&[Document::new("small")]));
        assert!(needs_escalation(&[Document::new("x".repeat(60 * 1024))]));

        let many: Vec<Document> = (0..30).map(|_| Document::new("y".repeat(40 * 1024))).collect();
        assert!(needs_escalation(&many));
    }

    #[tokio::test]
    async fn test_two_documents_without_store() {
        let options = DocumentProcessingOptions::default()
            .with_strategy(SplitStrategy::Paragraphs)
            .with_chunk_size(100, 10);
        let processor = processor(options);
        let documents = vec![
            Document::new(paragraphs(4)).with_id("multi"),
            Document::new("A single short paragraph that stands alone.").with_id("single"),
        ];

        let outcome = processor.process_documents(documents, None).await.unwrap();
        assert_eq!(outcome.document_count, 2);
        assert!(outcome.chunk_count >= 2);
        let embeddings = outcome.embeddings.unwrap();
        assert_eq!(embeddings.len(), outcome.chunk_count);
        assert_eq!(outcome.embedding_count, outcome.chunk_count);
        assert!(outcome.store_results.is_none());
        assert!(!outcome.escalated);
        assert_eq!(outcome.failed_batches, 0);

        let multi = embeddings
            .iter()
            .filter(|e| e.chunk.document_id == "multi")
            .count();
        assert!(multi > 1);
    }

    #[tokio::test]
    async fn test_with_store() {
        let processor = processor(DocumentProcessingOptions::default().with_chunk_size(200, 20));
        let store = InMemoryChunkStore::new();
        let documents: Vec<Document> = (0..3).map(|i| Document::new(paragraphs(i + 2))).collect();

        let outcome = processor
            .process_documents(documents, Some(Arc::new(store.clone())))
            .await
            .unwrap();

        assert!(outcome.embeddings.is_none());
        let receipts = outcome.store_results.unwrap();
        let stored: usize = receipts.iter().map(|r| r.stored).sum();
        assert_eq!(stored, outcome.chunk_count);
        assert_eq!(store.len(), outcome.chunk_count);
    }

    #[tokio::test]
    async fn test_large_corpus_escalates() {
        let processor = processor(DocumentProcessingOptions::default());
        let events = processor.subscribe();
        let documents = vec![Document::new("word ".repeat(12 * 1024))];

        let outcome = processor.process_documents(documents, None).await.unwrap();
        assert!(outcome.escalated);
        assert_eq!(outcome.embedding_count, outcome.chunk_count);
        // Monitoring takes snapshots after each group of batches
        assert!(!processor.optimizer().memory().history().is_empty());

        let operations: Vec<String> = events
            .drain()
            .filter_map(|event| match event {
                BatchEvent::ProcessingComplete { operation, .. } => Some(operation),
                _ => None,
            })
            .collect();
        assert_eq!(operations, vec!["chunking", "embedding"]);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let outcome = processor(DocumentProcessingOptions::default())
            .process_documents(vec![], None)
            .await
            .unwrap();
        assert_eq!(outcome.document_count, 0);
        assert_eq!(outcome.chunk_count, 0);
        assert_eq!(outcome.embeddings.unwrap().len(), 0);
    }
}
