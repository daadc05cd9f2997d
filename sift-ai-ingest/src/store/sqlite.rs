//! SQLite chunk store.
//!
//! ```sql
//! CREATE TABLE chunks (
//!     id TEXT PRIMARY KEY,             -- "{document_id}-chunk-{index}"
//!     document_id TEXT NOT NULL,
//!     chunk_index INTEGER NOT NULL,
//!     content TEXT NOT NULL,
//!     metadata TEXT NOT NULL,          -- JSON object
//!     embedding BLOB,                  -- f16 vector
//!     stored_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
//! );
//! ```
//!
//! The store doubles as a [`QueryConnection`] so it can be registered with the
//! database memory manager and read through a monitored, cached handle.

use super::{ChunkStore, StoreReceipt};
use crate::db::QueryConnection;
use crate::error::{IngestError, Result};
use crate::pipeline::{DocumentChunk, EmbeddedChunk};
use async_trait::async_trait;
use half::f16;
use serde_json::{Map, Value, json};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const DEFAULT_SEARCH_LIMIT: i64 = 20;

#[derive(Clone, Debug)]
pub struct SqliteChunkStore {
    pool: SqlitePool,
}

impl SqliteChunkStore {
    /// Open (or create) a store in the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(Duration::from_secs(5))
                .create_if_missing(true),
        )
        .await?;
        Self::new_with_pool(pool).await
    }

    /// In-memory store. A single pooled connection keeps every query on the same database.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect("sqlite::memory:")
            .await?;
        Self::new_with_pool(pool).await
    }

    async fn new_with_pool(pool: SqlitePool) -> Result<Self> {
        Self::create_tables(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL,
                embedding BLOB,
                stored_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
            .execute(pool)
            .await?;

        Ok(())
    }

    pub async fn count_chunks(&self) -> Result<usize> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    pub async fn get_chunk(&self, id: &str) -> Result<Option<EmbeddedChunk>> {
        let row = sqlx::query(
            "SELECT id, document_id, chunk_index, content, metadata, embedding FROM chunks WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(embedded_from_row).transpose()
    }

    pub async fn document_chunks(&self, document_id: &str) -> Result<Vec<EmbeddedChunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_index, content, metadata, embedding FROM chunks WHERE document_id = ?1 ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(embedded_from_row).collect()
    }

    /// Chunks whose content contains `query`, without their embeddings.
    pub async fn search_text(&self, query: &str, limit: usize) -> Result<Vec<DocumentChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, chunk_index, content, metadata FROM chunks
            WHERE instr(content, ?1) > 0
            ORDER BY document_id, chunk_index
            LIMIT ?2
            "#,
        )
        .bind(query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn chunk_from_row(row: &SqliteRow) -> Result<DocumentChunk> {
    let chunk_index: i64 = row.get("chunk_index");
    let metadata: String = row.get("metadata");
    let metadata: Map<String, Value> = serde_json::from_str(&metadata)?;
    Ok(DocumentChunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: chunk_index as usize,
        content: row.get("content"),
        metadata,
    })
}

fn embedded_from_row(row: &SqliteRow) -> Result<EmbeddedChunk> {
    let chunk = chunk_from_row(row)?;
    let embedding_bytes: Option<Vec<u8>> = row.get("embedding");
    let embedding = embedding_bytes
        .map(|bytes| {
            bytes
                .chunks_exact(2)
                .map(bytemuck::pod_read_unaligned::<f16>)
                .collect()
        })
        .unwrap_or_default();
    Ok(EmbeddedChunk { chunk, embedding })
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn store_chunks(&self, chunks: Vec<EmbeddedChunk>) -> Result<StoreReceipt> {
        let mut tx = self.pool.begin().await?;

        for embedded in &chunks {
            let chunk = &embedded.chunk;
            let metadata = serde_json::to_string(&chunk.metadata)?;
            let embedding_bytes = bytemuck::cast_slice::<f16, u8>(&embedded.embedding);

            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, content, metadata, embedding)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(id) DO UPDATE SET
                    document_id = excluded.document_id,
                    chunk_index = excluded.chunk_index,
                    content = excluded.content,
                    metadata = excluded.metadata,
                    embedding = excluded.embedding,
                    stored_at = CURRENT_TIMESTAMP
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index as i64)
            .bind(&chunk.content)
            .bind(metadata)
            .bind(embedding_bytes)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(stored = chunks.len(), "Stored chunk batch");
        Ok(StoreReceipt::for_chunks(&chunks))
    }
}

fn str_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| IngestError::invalid_input(format!("missing string argument `{name}`")))
}

#[async_trait]
impl QueryConnection for SqliteChunkStore {
    async fn execute(&self, method: &str, args: &Value) -> anyhow::Result<Value> {
        let value = match method {
            "count_chunks" => json!(self.count_chunks().await?),
            "get_chunk" => serde_json::to_value(self.get_chunk(str_arg(args, "id")?).await?)?,
            "document_chunks" => {
                let chunks = self.document_chunks(str_arg(args, "document_id")?).await?;
                serde_json::to_value(chunks)?
            }
            "search_text" => {
                let limit = args
                    .get("limit")
                    .and_then(Value::as_i64)
                    .unwrap_or(DEFAULT_SEARCH_LIMIT)
                    .max(0) as usize;
                let chunks = self.search_text(str_arg(args, "query")?, limit).await?;
                serde_json::to_value(chunks)?
            }
            other => anyhow::bail!("unsupported method `{other}`"),
        };
        Ok(value)
    }

    /// Counts change with every write, so they are always read fresh.
    fn is_cacheable(&self, method: &str) -> bool {
        method != "count_chunks"
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn embedded(doc: &str, index: usize, content: &str) -> EmbeddedChunk {
        let mut metadata = Map::new();
        metadata.insert("source".into(), json!(format!("{doc}.txt")));
        EmbeddedChunk {
            chunk: DocumentChunk::new(doc, index, content).with_metadata(metadata),
            embedding: vec![f16::from_f32(0.5), f16::from_f32(-0.25), f16::ONE],
        }
    }

    #[tokio::test]
    async fn test_store_and_read_back() {
        let store = SqliteChunkStore::open_memory().await.unwrap();
        let receipt = store
            .store_chunks(vec![
                embedded("a", 1, "second chunk of a"),
                embedded("a", 0, "first chunk of a"),
                embedded("b", 0, "only chunk of b"),
            ])
            .await
            .unwrap();
        assert_eq!(receipt.stored, 3);
        assert_eq!(store.count_chunks().await.unwrap(), 3);

        let chunk = store.get_chunk("a-chunk-0").await.unwrap().unwrap();
        assert_eq!(chunk.chunk.content, "first chunk of a");
        assert_eq!(chunk.chunk.metadata["source"], "a.txt");
        assert_eq!(chunk.embedding, embedded("a", 0, "").embedding);
        assert!(store.get_chunk("missing").await.unwrap().is_none());

        let doc_a = store.document_chunks("a").await.unwrap();
        assert_eq!(doc_a.len(), 2);
        assert_eq!(doc_a[0].chunk.chunk_index, 0);
        assert_eq!(doc_a[1].chunk.chunk_index, 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let store = SqliteChunkStore::open_memory().await.unwrap();
        store.store_chunks(vec![embedded("a", 0, "old")]).await.unwrap();
        store.store_chunks(vec![embedded("a", 0, "new")]).await.unwrap();

        assert_eq!(store.count_chunks().await.unwrap(), 1);
        let chunk = store.get_chunk("a-chunk-0").await.unwrap().unwrap();
        assert_eq!(chunk.chunk.content, "new");
    }

    #[tokio::test]
    async fn test_search_text() {
        let store = SqliteChunkStore::open_memory().await.unwrap();
        store
            .store_chunks(vec![
                embedded("a", 0, "memory pressure rises"),
                embedded("a", 1, "batches shrink"),
                embedded("b", 0, "pressure drops again"),
            ])
            .await
            .unwrap();

        let hits = store.search_text("pressure", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a-chunk-0");
        assert_eq!(hits[1].id, "b-chunk-0");

        assert_eq!(store.search_text("pressure", 1).await.unwrap().len(), 1);
        assert!(store.search_text("absent", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_connection_methods() {
        let store = SqliteChunkStore::open_memory().await.unwrap();
        store
            .store_chunks(vec![embedded("a", 0, "hello world")])
            .await
            .unwrap();

        let count = store.execute("count_chunks", &json!({})).await.unwrap();
        assert_eq!(count, json!(1));

        let chunk = store
            .execute("get_chunk", &json!({"id": "a-chunk-0"}))
            .await
            .unwrap();
        assert_eq!(chunk["content"], "hello world");

        let missing = store
            .execute("get_chunk", &json!({"id": "nope"}))
            .await
            .unwrap();
        assert!(missing.is_null());

        let hits = store
            .execute("search_text", &json!({"query": "world"}))
            .await
            .unwrap();
        assert_eq!(hits.as_array().unwrap().len(), 1);

        assert!(store.execute("get_chunk", &json!({})).await.is_err());
        assert!(store.execute("drop_table", &json!({})).await.is_err());

        assert!(!store.is_cacheable("count_chunks"));
        assert!(store.is_cacheable("get_chunk"));
    }

    #[tokio::test]
    async fn test_on_disk_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.db");

        let store = SqliteChunkStore::open(&path).await.unwrap();
        store
            .store_chunks(vec![embedded("a", 0, "persisted")])
            .await
            .unwrap();
        store.close().await;

        let reopened = SqliteChunkStore::open(&path).await.unwrap();
        assert_eq!(reopened.count_chunks().await.unwrap(), 1);
        let chunk = reopened.get_chunk("a-chunk-0").await.unwrap().unwrap();
        assert_eq!(chunk.chunk.content, "persisted");
    }
}
