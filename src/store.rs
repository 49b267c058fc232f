//! The chunk persistence boundary.
//!
//! Every store operation is treated as atomic per call. `save_chunks` is an
//! idempotent overwrite keyed by chunk id, which is how embeddings are
//! attached after the fact.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{document::Chunk, error::Result};

#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert or replace chunks by id.
    async fn save_chunks(&self, chunks: &[Chunk]) -> Result<()>;

    /// All chunks of a document, in the order they were first saved.
    async fn get_chunks_by_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<Chunk>>;

    /// Chunks of a single chapter. Empty when the chapter is unknown.
    async fn get_chunks_by_document_chapter(
        &self,
        document_id: &str,
        chapter_id: &str,
    ) -> Result<Vec<Chunk>>;

    /// Chunks for the given ids, in request order. Unknown ids are skipped.
    async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>>;

    async fn has_chunks(&self, document_id: &str) -> Result<bool>;

    async fn delete_chunks_by_document(&self, document_id: &str) -> Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    by_sequence: BTreeMap<u64, Chunk>,
    sequence_of: HashMap<String, u64>,
    next_sequence: u64,
}

/// Process-local [`ChunkStore`], used by tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemoryChunkStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of chunks across all documents.
    pub async fn len(&self) -> usize {
        self.inner.read().await.by_sequence.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn save_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for chunk in chunks {
            let sequence = match inner.sequence_of.get(&chunk.id) {
                Some(&existing) => existing,
                None => {
                    let sequence = inner.next_sequence;
                    inner.next_sequence += 1;
                    inner.sequence_of.insert(chunk.id.clone(), sequence);
                    sequence
                }
            };
            inner.by_sequence.insert(sequence, chunk.clone());
        }
        Ok(())
    }

    async fn get_chunks_by_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<Chunk>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_sequence
            .values()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn get_chunks_by_document_chapter(
        &self,
        document_id: &str,
        chapter_id: &str,
    ) -> Result<Vec<Chunk>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_sequence
            .values()
            .filter(|c| c.document_id == document_id && c.chapter_id == chapter_id)
            .cloned()
            .collect())
    }

    async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.sequence_of.get(id))
            .filter_map(|sequence| inner.by_sequence.get(sequence))
            .cloned()
            .collect())
    }

    async fn has_chunks(&self, document_id: &str) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_sequence
            .values()
            .any(|c| c.document_id == document_id))
    }

    async fn delete_chunks_by_document(&self, document_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let doomed: Vec<(u64, String)> = inner
            .by_sequence
            .iter()
            .filter(|(_, c)| c.document_id == document_id)
            .map(|(&sequence, c)| (sequence, c.id.clone()))
            .collect();
        for (sequence, id) in doomed {
            inner.by_sequence.remove(&sequence);
            inner.sequence_of.remove(&id);
        }
        Ok(())
    }
}
