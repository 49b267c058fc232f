//! Background embedding backfill.
//!
//! Documents waiting for embeddings sit in an [`EmbeddingQueue`]. A single
//! drain loop works through them one document at a time, in small batches,
//! yielding between batches. Removing a document from the queue is how
//! backfill is cancelled.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, info, warn};

use crate::{
    document::Chunk,
    embedding::{LazyEmbedder, SharedProvider},
    error::{Error, Result},
    status::{IndexState, StatusBoard, percent},
    store::ChunkStore,
};

/// Chunks embedded per batch.
pub const DEFAULT_EMBEDDING_BATCH_SIZE: usize = 8;

#[derive(Debug, Default)]
struct QueueInner {
    order: VecDeque<QueueTicket>,
    members: HashMap<String, u64>,
    next_generation: u64,
}

/// One queued backfill request.
///
/// Removing and re-adding a document (as a reindex does) issues a new
/// generation, so work started for an older ticket can tell it is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTicket {
    pub document_id: String,
    pub generation: u64,
}

/// FIFO of document ids awaiting embeddings, with set membership.
#[derive(Debug, Default)]
pub struct EmbeddingQueue {
    inner: Mutex<QueueInner>,
    draining: AtomicBool,
    /// Held while backfill persists a batch and while a document's chunks
    /// are deleted, so neither interleaves with the other.
    write_gate: tokio::sync::Mutex<()>,
}

impl EmbeddingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document at the back. Returns `false` if it was already queued.
    pub fn enqueue(&self, document_id: &str) -> bool {
        let mut inner = self.lock();
        if inner.members.contains_key(document_id) {
            return false;
        }
        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.members.insert(document_id.to_string(), generation);
        inner.order.push_back(QueueTicket {
            document_id: document_id.to_string(),
            generation,
        });
        true
    }

    /// Drop a document from the queue, cancelling any backfill in progress
    /// for it at the next batch boundary.
    pub fn remove(&self, document_id: &str) -> bool {
        let mut inner = self.lock();
        if inner.members.remove(document_id).is_none() {
            return false;
        }
        inner.order.retain(|t| t.document_id != document_id);
        true
    }

    /// Mark a ticket as done. A newer ticket for the same document stays
    /// queued. Returns whether the ticket was still current.
    pub fn finish(&self, ticket: &QueueTicket) -> bool {
        let mut inner = self.lock();
        if inner.members.get(&ticket.document_id) != Some(&ticket.generation) {
            return false;
        }
        inner.members.remove(&ticket.document_id);
        inner.order.retain(|t| t != ticket);
        debug!(document = %ticket.document_id, "left the embedding queue");
        true
    }

    pub fn contains(&self, document_id: &str) -> bool {
        self.lock().members.contains_key(document_id)
    }

    /// Whether `ticket` is still the queued request for its document.
    pub fn is_current(&self, ticket: &QueueTicket) -> bool {
        self.lock().members.get(&ticket.document_id) == Some(&ticket.generation)
    }

    /// Queued document ids, oldest first.
    pub fn pending(&self) -> Vec<String> {
        self.lock().order.iter().map(|t| t.document_id.clone()).collect()
    }

    /// The oldest ticket, left in place.
    pub fn front(&self) -> Option<QueueTicket> {
        self.lock().order.front().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().order.is_empty()
    }

    /// Whether a drain loop is currently running.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Wait until no backfill batch is being persisted, and keep it that
    /// way until the guard is dropped. Remove the document from the queue
    /// before taking the gate to delete its chunks.
    pub async fn write_gate(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_gate.lock().await
    }

    fn begin_drain(&self) -> Option<DrainGuard<'_>> {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainGuard(&self.draining))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Everything the drain loop needs besides the queue.
#[derive(Clone, Copy)]
pub struct BackfillContext<'a> {
    pub store: &'a dyn ChunkStore,
    pub embedder: &'a LazyEmbedder,
    pub status: &'a StatusBoard,
    pub batch_size: usize,
}

/// Process queued documents until the queue is empty.
///
/// Only one drain runs at a time; a call made while another is active
/// returns immediately with 0. Returns the number of tickets taken off
/// the queue. Failures are logged and the failing document is dropped,
/// never retried.
pub async fn drain_queue(queue: &EmbeddingQueue, ctx: BackfillContext<'_>) -> usize {
    let mut processed = 0;
    loop {
        let Some(guard) = queue.begin_drain() else {
            return processed;
        };

        while let Some(ticket) = queue.front() {
            let document_id = ticket.document_id.as_str();
            match backfill_document(queue, ctx, &ticket).await {
                Ok(embedded) => {
                    debug!(document = document_id, embedded, "backfill pass done");
                }
                Err(error) => {
                    warn!(document = document_id, %error, "embedding backfill failed");
                }
            }
            queue.finish(&ticket);
            processed += 1;
        }

        drop(guard);
        // An enqueue may have raced with the guard release.
        if queue.is_empty() {
            return processed;
        }
    }
}

async fn backfill_document(
    queue: &EmbeddingQueue,
    ctx: BackfillContext<'_>,
    ticket: &QueueTicket,
) -> Result<usize> {
    let document_id = ticket.document_id.as_str();
    let Some(provider) = ctx.embedder.get().await else {
        debug!(document = document_id, "no embedding provider, skipping backfill");
        return Ok(0);
    };
    let model = provider.model().to_string();

    let chunks = ctx.store.get_chunks_by_document(document_id).await?;
    if chunks.is_empty() {
        return Ok(0);
    }

    let missing: Vec<Chunk> = chunks
        .into_iter()
        .filter(|chunk| !chunk.has_embedding_from(&model))
        .collect();
    if !queue.is_current(ticket) {
        return Ok(0);
    }
    if missing.is_empty() {
        ctx.status.set(document_id, IndexState::FullyIndexed);
        return Ok(0);
    }

    info!(
        document = document_id,
        model = %model,
        chunks = missing.len(),
        "embedding backfill started"
    );
    ctx.status.set(document_id, IndexState::EmbeddingBackfill);

    let total = missing.len();
    let mut embedded = 0;
    for batch in missing.chunks(ctx.batch_size.max(1)) {
        if !queue.is_current(ticket) {
            debug!(document = document_id, embedded, "backfill cancelled");
            return Ok(embedded);
        }

        let updated = embed_batch(&provider, &model, batch).await?;

        {
            // The chunks this batch was computed from may have been deleted
            // or replaced while it was embedding.
            let _gate = queue.write_gate().await;
            if !queue.is_current(ticket) {
                debug!(document = document_id, embedded, "stale backfill batch discarded");
                return Ok(embedded);
            }
            ctx.store.save_chunks(&updated).await?;
        }

        embedded += updated.len();
        ctx.status.report(
            document_id,
            IndexState::EmbeddingBackfill,
            percent(embedded, total),
        );
        tokio::task::yield_now().await;
    }

    ctx.status.set(document_id, IndexState::FullyIndexed);
    info!(document = document_id, embedded, "embedding backfill finished");
    Ok(embedded)
}

async fn embed_batch(
    provider: &SharedProvider,
    model: &str,
    batch: &[Chunk],
) -> Result<Vec<Chunk>> {
    let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
    let worker = provider.clone();
    let vectors = tokio::task::spawn_blocking(move || worker.embed(&texts))
        .await
        .map_err(|e| Error::Embedding(format!("embedding task failed: {e}")))??;

    if vectors.len() != batch.len() {
        return Err(Error::Embedding(format!(
            "expected {} vectors, provider returned {}",
            batch.len(),
            vectors.len()
        )));
    }

    Ok(batch
        .iter()
        .cloned()
        .zip(vectors)
        .map(|(mut chunk, vector)| {
            chunk.embedding = Some(vector);
            chunk.embedding_model = Some(model.to_string());
            chunk
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        embedding::{EmbeddingProvider, HashEmbedder},
        store::{MemoryChunkStore, test_support::chunk},
    };

    async fn seeded_store(document_id: &str, count: usize) -> MemoryChunkStore {
        let store = MemoryChunkStore::new();
        let chunks: Vec<Chunk> = (0..count)
            .map(|i| chunk(document_id, "1", i, &format!("passage number {i} about whales")))
            .collect();
        store.save_chunks(&chunks).await.unwrap();
        store
    }

    fn ctx<'a>(
        store: &'a MemoryChunkStore,
        embedder: &'a LazyEmbedder,
        status: &'a StatusBoard,
        batch_size: usize,
    ) -> BackfillContext<'a> {
        BackfillContext {
            store,
            embedder,
            status,
            batch_size,
        }
    }

    struct CountingEmbedder {
        inner: HashEmbedder,
        calls: AtomicUsize,
    }

    impl EmbeddingProvider for CountingEmbedder {
        fn model(&self) -> &str {
            self.inner.model()
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(texts)
        }
    }

    struct FailingEmbedder;

    impl EmbeddingProvider for FailingEmbedder {
        fn model(&self) -> &str {
            "failing"
        }

        fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(Error::Embedding("out of memory".to_string()))
        }
    }

    /// Removes the document from the queue the first time it is asked to
    /// embed anything.
    struct CancellingEmbedder {
        queue: Arc<EmbeddingQueue>,
        document_id: String,
    }

    impl EmbeddingProvider for CancellingEmbedder {
        fn model(&self) -> &str {
            "cancelling"
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.queue.remove(&self.document_id);
            Ok(texts.iter().map(|_| vec![1.0]).collect())
        }
    }

    /// Removes and re-queues the document during its first embedding
    /// call, the way a reindex does.
    struct RequeueingEmbedder {
        queue: Arc<EmbeddingQueue>,
        document_id: String,
        requeued: AtomicBool,
        calls: AtomicUsize,
    }

    impl EmbeddingProvider for RequeueingEmbedder {
        fn model(&self) -> &str {
            "requeueing"
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.requeued.swap(true, Ordering::SeqCst) {
                self.queue.remove(&self.document_id);
                self.queue.enqueue(&self.document_id);
            }
            Ok(texts.iter().map(|_| vec![1.0]).collect())
        }
    }

    #[test]
    fn queue_is_fifo_and_deduplicated() {
        let queue = EmbeddingQueue::new();
        assert!(queue.enqueue("a"));
        assert!(queue.enqueue("b"));
        assert!(!queue.enqueue("a"));
        assert!(queue.enqueue("c"));

        assert_eq!(queue.pending(), vec!["a", "b", "c"]);
        assert_eq!(queue.front().unwrap().document_id, "a");
        assert_eq!(queue.len(), 3);

        assert!(queue.remove("b"));
        assert!(!queue.remove("b"));
        assert!(!queue.contains("b"));
        assert_eq!(queue.pending(), vec!["a", "c"]);

        let a = queue.front().unwrap();
        assert!(queue.finish(&a));
        let c = queue.front().unwrap();
        assert!(queue.finish(&c));
        assert!(queue.is_empty());
    }

    #[test]
    fn requeued_document_gets_a_new_ticket() {
        let queue = EmbeddingQueue::new();
        queue.enqueue("a");
        let old = queue.front().unwrap();

        queue.remove("a");
        queue.enqueue("a");
        let new = queue.front().unwrap();

        assert_ne!(old.generation, new.generation);
        assert!(!queue.is_current(&old));
        assert!(queue.is_current(&new));

        // Finishing the stale ticket leaves the new request queued.
        assert!(!queue.finish(&old));
        assert_eq!(queue.pending(), vec!["a"]);
        assert!(queue.finish(&new));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn drain_embeds_every_chunk() {
        let store = seeded_store("book", 19).await;
        let embedder = LazyEmbedder::ready(Arc::new(HashEmbedder::new(32)));
        let status = StatusBoard::new();
        let queue = EmbeddingQueue::new();
        queue.enqueue("book");

        let processed = drain_queue(&queue, ctx(&store, &embedder, &status, 8)).await;

        assert_eq!(processed, 1);
        assert!(queue.is_empty());
        assert!(!queue.is_draining());
        let chunks = store.get_chunks_by_document("book").await.unwrap();
        assert!(chunks.iter().all(|c| c.has_embedding_from("fnv1a-hash-32")));
        assert_eq!(status.state("book"), IndexState::FullyIndexed);
    }

    #[tokio::test]
    async fn batches_follow_batch_size() {
        let store = seeded_store("book", 17).await;
        let counting = Arc::new(CountingEmbedder {
            inner: HashEmbedder::new(16),
            calls: AtomicUsize::new(0),
        });
        let embedder = LazyEmbedder::ready(counting.clone());
        let status = StatusBoard::new();
        let queue = EmbeddingQueue::new();
        queue.enqueue("book");

        drain_queue(&queue, ctx(&store, &embedder, &status, 8)).await;
        assert_eq!(counting.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn only_missing_chunks_are_embedded() {
        let store = seeded_store("book", 4).await;
        let model = HashEmbedder::new(16).model().to_string();

        let mut done = store.get_chunks_by_ids(&["book-1-chunk-0".to_string()]).await.unwrap();
        done[0].embedding = Some(vec![0.5; 16]);
        done[0].embedding_model = Some(model.clone());
        store.save_chunks(&done).await.unwrap();

        let counting = Arc::new(CountingEmbedder {
            inner: HashEmbedder::new(16),
            calls: AtomicUsize::new(0),
        });
        let embedder = LazyEmbedder::ready(counting.clone());
        let status = StatusBoard::new();
        let queue = EmbeddingQueue::new();
        queue.enqueue("book");

        drain_queue(&queue, ctx(&store, &embedder, &status, 1)).await;

        assert_eq!(counting.calls.load(Ordering::SeqCst), 3);
        let kept = store.get_chunks_by_ids(&["book-1-chunk-0".to_string()]).await.unwrap();
        assert_eq!(kept[0].embedding, Some(vec![0.5; 16]));

        // A second pass finds nothing left to do.
        queue.enqueue("book");
        drain_queue(&queue, ctx(&store, &embedder, &status, 1)).await;
        assert_eq!(counting.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unavailable_provider_clears_queue() {
        let store = seeded_store("book", 3).await;
        let embedder = LazyEmbedder::unavailable();
        let status = StatusBoard::new();
        let queue = EmbeddingQueue::new();
        queue.enqueue("book");

        assert_eq!(drain_queue(&queue, ctx(&store, &embedder, &status, 8)).await, 1);
        assert!(queue.is_empty());
        let chunks = store.get_chunks_by_document("book").await.unwrap();
        assert!(chunks.iter().all(|c| c.embedding.is_none()));
    }

    #[tokio::test]
    async fn failure_drops_document_and_continues() {
        let store = seeded_store("a", 2).await;
        let embedder = LazyEmbedder::ready(Arc::new(FailingEmbedder));
        let status = StatusBoard::new();
        let queue = EmbeddingQueue::new();
        queue.enqueue("a");
        queue.enqueue("b");

        assert_eq!(drain_queue(&queue, ctx(&store, &embedder, &status, 8)).await, 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn removal_cancels_in_flight_backfill() {
        let store = seeded_store("book", 6).await;
        let queue = Arc::new(EmbeddingQueue::new());
        let embedder = LazyEmbedder::ready(Arc::new(CancellingEmbedder {
            queue: queue.clone(),
            document_id: "book".to_string(),
        }));
        let status = StatusBoard::new();
        queue.enqueue("book");

        drain_queue(&queue, ctx(&store, &embedder, &status, 2)).await;

        let chunks = store.get_chunks_by_document("book").await.unwrap();
        assert!(chunks.iter().all(|c| c.embedding.is_none()));
        assert_ne!(status.state("book"), IndexState::FullyIndexed);
    }

    #[tokio::test]
    async fn requeue_mid_batch_discards_stale_work_and_restarts() {
        let store = seeded_store("book", 6).await;
        let queue = Arc::new(EmbeddingQueue::new());
        let requeueing = Arc::new(RequeueingEmbedder {
            queue: queue.clone(),
            document_id: "book".to_string(),
            requeued: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        });
        let embedder = LazyEmbedder::ready(requeueing.clone());
        let status = StatusBoard::new();
        queue.enqueue("book");

        let processed = drain_queue(&queue, ctx(&store, &embedder, &status, 2)).await;

        // The first batch is thrown away, then the new request embeds all
        // three batches.
        assert_eq!(processed, 2);
        assert_eq!(requeueing.calls.load(Ordering::SeqCst), 4);
        assert!(queue.is_empty());
        let chunks = store.get_chunks_by_document("book").await.unwrap();
        assert_eq!(chunks.len(), 6);
        assert!(chunks.iter().all(|c| c.has_embedding_from("requeueing")));
        assert_eq!(status.state("book"), IndexState::FullyIndexed);
    }

    #[tokio::test]
    async fn concurrent_drain_is_a_no_op() {
        let store = seeded_store("book", 1).await;
        let embedder = LazyEmbedder::ready(Arc::new(HashEmbedder::new(8)));
        let status = StatusBoard::new();
        let queue = EmbeddingQueue::new();
        queue.enqueue("book");

        let guard = queue.begin_drain();
        assert!(guard.is_some());
        assert!(queue.is_draining());
        assert_eq!(drain_queue(&queue, ctx(&store, &embedder, &status, 8)).await, 0);
        assert_eq!(queue.pending(), vec!["book"]);

        drop(guard);
        assert_eq!(drain_queue(&queue, ctx(&store, &embedder, &status, 8)).await, 1);
    }
}
