//! The application-facing entry point: index documents, search them, and
//! keep embeddings catching up in the background.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde::Serialize;
use tokio::sync::{mpsc::unbounded_channel, watch};
use tracing::{debug, info, warn};

use crate::{
    backfill::{self, BackfillContext, EmbeddingQueue},
    chunking::ChunkingOptions,
    config::RetrievalConfig,
    document::{Chunk, Document},
    embedding::LazyEmbedder,
    error::{Error, Result},
    protocol::{IndexRequest, JobId, WorkerResponse},
    ranking::SearchResult,
    scheduler::{InlineScheduler, Scheduler, SchedulerKind},
    search::{self, SearchOptions, SearchOutcome},
    status::{IndexProgress, IndexState, StatusBoard, percent},
    store::{ChunkStore, MemoryChunkStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IndexOutcome {
    /// Chunks already existed; nothing was re-chunked.
    AlreadyIndexed,
    Indexed {
        chunk_count: usize,
    },
    /// The job was cancelled or superseded before it finished.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub document_id: String,
    #[serde(flatten)]
    pub outcome: IndexOutcome,
}

enum JobOutcome {
    Complete(usize),
    Cancelled,
    /// The job ended without `complete`.
    Failed,
}

pub struct Retriever {
    store: Arc<dyn ChunkStore>,
    scheduler: Arc<dyn Scheduler>,
    embedder: Arc<LazyEmbedder>,
    queue: Arc<EmbeddingQueue>,
    status: Arc<StatusBoard>,
    config: RetrievalConfig,
    active: Mutex<HashMap<String, JobId>>,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        scheduler: Arc<dyn Scheduler>,
        embedder: Arc<LazyEmbedder>,
        queue: Arc<EmbeddingQueue>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            embedder,
            queue,
            status: Arc::new(StatusBoard::new()),
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// In-memory store, inline chunking, no embedding provider.
    pub fn in_memory() -> Self {
        let config = RetrievalConfig::default();
        Self::new(
            Arc::new(MemoryChunkStore::new()),
            Arc::new(InlineScheduler {
                yield_every: config.inline_yield_every,
            }),
            Arc::new(LazyEmbedder::unavailable()),
            Arc::new(EmbeddingQueue::new()),
            config,
        )
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<EmbeddingQueue> {
        &self.queue
    }

    pub fn embedder(&self) -> &Arc<LazyEmbedder> {
        &self.embedder
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn scheduler_kind(&self) -> SchedulerKind {
        self.scheduler.kind()
    }

    /// Chunk and persist a document.
    ///
    /// Idempotent: a document that already has chunks is not re-chunked,
    /// only queued for embedding backfill. `options` defaults to the
    /// configured chunking options.
    pub async fn index_document(
        &self,
        document: &Document,
        options: Option<ChunkingOptions>,
    ) -> Result<IndexReport> {
        let options = options.unwrap_or(self.config.chunking);
        options.validate()?;
        let document_id = document.id.clone();

        if self.store.has_chunks(&document_id).await? {
            debug!(document = %document_id, "already indexed");
            if self.status.state(&document_id) == IndexState::NotIndexed {
                self.status.set(&document_id, IndexState::ChunkedLexicalReady);
            }
            if self.config.generate_embeddings {
                self.queue_backfill(&document_id);
            }
            return Ok(IndexReport {
                document_id,
                outcome: IndexOutcome::AlreadyIndexed,
            });
        }

        let request = IndexRequest::new(document, options, self.config.chunk_batch_size);
        let job_id = request.job_id;
        self.activate(&document_id, job_id);
        self.status.set(&document_id, IndexState::Chunking);
        info!(
            document = %document_id,
            job = %job_id,
            chapters = document.chapters.len(),
            scheduler = %self.scheduler.kind(),
            "indexing document"
        );

        let mut outcome = self.run_job(self.scheduler.as_ref(), request.clone()).await?;

        if matches!(outcome, JobOutcome::Failed) {
            if self.scheduler.kind() == SchedulerKind::Inline {
                self.abandon(&document_id, job_id).await?;
                return Err(Error::Protocol(
                    "chunking job ended without completing".to_string(),
                ));
            }
            warn!(document = %document_id, "indexing worker failed, chunking inline");
            self.purge_chunks(&document_id).await?;
            let inline = InlineScheduler {
                yield_every: self.config.inline_yield_every,
            };
            outcome = self.run_job(&inline, request).await?;
        }

        let chunk_count = match outcome {
            JobOutcome::Complete(count) => count,
            JobOutcome::Cancelled => {
                info!(document = %document_id, job = %job_id, "indexing cancelled");
                self.abandon(&document_id, job_id).await?;
                return Ok(IndexReport {
                    document_id,
                    outcome: IndexOutcome::Cancelled,
                });
            }
            JobOutcome::Failed => {
                self.abandon(&document_id, job_id).await?;
                return Err(Error::Protocol(
                    "chunking job ended without completing".to_string(),
                ));
            }
        };

        self.deactivate(&document_id, job_id);

        if chunk_count == 0 {
            self.status.clear(&document_id);
            return Err(Error::ChunkingProducedNothing { document_id });
        }

        self.status.set(&document_id, IndexState::ChunkedLexicalReady);
        info!(document = %document_id, chunks = chunk_count, "document indexed");

        if self.config.generate_embeddings {
            self.queue_backfill(&document_id);
        }

        Ok(IndexReport {
            document_id,
            outcome: IndexOutcome::Indexed { chunk_count },
        })
    }

    /// Drop existing chunks and index from scratch.
    pub async fn reindex_document(
        &self,
        document: &Document,
        options: Option<ChunkingOptions>,
    ) -> Result<IndexReport> {
        self.cancel(&document.id);
        self.purge_chunks(&document.id).await?;
        self.status.clear(&document.id);
        self.index_document(document, options).await
    }

    pub async fn search(
        &self,
        query: &str,
        document_id: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        Ok(self.search_outcome(query, document_id, options).await?.results)
    }

    /// Like [`Retriever::search`], but also reports how results were ranked.
    ///
    /// Queues the document for backfill when the provider is available but
    /// embeddings are incomplete.
    pub async fn search_outcome(
        &self,
        query: &str,
        document_id: &str,
        options: &SearchOptions,
    ) -> Result<SearchOutcome> {
        let outcome = search::execute_search(
            query,
            document_id,
            options,
            self.store.as_ref(),
            &self.embedder,
            self.config.rrf_k,
        )
        .await?;

        if outcome.needs_backfill {
            self.queue_backfill(document_id);
        }
        Ok(outcome)
    }

    pub async fn get_chunk_by_id(&self, id: &str) -> Result<Option<Chunk>> {
        let mut chunks = self.store.get_chunks_by_ids(&[id.to_string()]).await?;
        Ok(chunks.pop())
    }

    /// Stop listening to the active indexing job and drop pending backfill.
    ///
    /// Returns whether anything was cancelled.
    pub fn cancel(&self, document_id: &str) -> bool {
        let job = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(document_id);
        let queued = self.queue.remove(document_id);
        if let Some(job) = job {
            debug!(document = document_id, job = %job, "indexing job cancelled");
        }
        job.is_some() || queued
    }

    /// Cancel pending work and delete every chunk of a document.
    pub async fn remove_document(&self, document_id: &str) -> Result<()> {
        self.cancel(document_id);
        self.purge_chunks(document_id).await?;
        self.status.clear(document_id);
        info!(document = document_id, "document removed");
        Ok(())
    }

    pub fn state(&self, document_id: &str) -> IndexState {
        self.status.state(document_id)
    }

    pub fn progress(&self) -> watch::Receiver<Option<IndexProgress>> {
        self.status.subscribe()
    }

    /// Run the backfill drain loop on the current task until the queue is
    /// empty. Returns the number of documents processed.
    pub async fn drain_backfill(&self) -> usize {
        backfill::drain_queue(
            &self.queue,
            BackfillContext {
                store: self.store.as_ref(),
                embedder: &self.embedder,
                status: &self.status,
                batch_size: self.config.embedding_batch_size,
            },
        )
        .await
    }

    fn queue_backfill(&self, document_id: &str) {
        if self.queue.enqueue(document_id) {
            debug!(document = document_id, "queued for embedding backfill");
        }
        if self.config.auto_backfill && !self.queue.is_draining() {
            self.spawn_backfill();
        }
    }

    fn spawn_backfill(&self) {
        let store = self.store.clone();
        let embedder = self.embedder.clone();
        let status = self.status.clone();
        let queue = self.queue.clone();
        let batch_size = self.config.embedding_batch_size;

        tokio::spawn(async move {
            let ctx = BackfillContext {
                store: store.as_ref(),
                embedder: &embedder,
                status: &status,
                batch_size,
            };
            backfill::drain_queue(&queue, ctx).await
        });
    }

    /// Run one job on `scheduler`, persisting batches in arrival order.
    async fn run_job(
        &self,
        scheduler: &dyn Scheduler,
        request: IndexRequest,
    ) -> Result<JobOutcome> {
        let job_id = request.job_id;
        let document_id = request.document.id.clone();
        let (tx, mut rx) = unbounded_channel::<WorkerResponse>();

        let consumer = async move {
            let mut persisted = 0usize;
            while let Some(response) = rx.recv().await {
                if response.job_id() != job_id {
                    debug!(job = %response.job_id(), "ignoring message from stale job");
                    continue;
                }
                if !self.is_active(&document_id, job_id) {
                    return Ok(JobOutcome::Cancelled);
                }

                match response {
                    WorkerResponse::ChunkBatch {
                        chunks,
                        chapter_index,
                        total_chapters,
                        ..
                    } => {
                        self.store.save_chunks(&chunks).await?;
                        persisted += chunks.len();
                        self.status.report(
                            &document_id,
                            IndexState::Chunking,
                            percent(chapter_index, total_chapters),
                        );
                    }
                    WorkerResponse::Progress { current, total, .. } => {
                        self.status.report(
                            &document_id,
                            IndexState::Chunking,
                            percent(current, total),
                        );
                    }
                    WorkerResponse::Complete { chunk_count, .. } => {
                        if chunk_count != persisted {
                            warn!(
                                document = %document_id,
                                reported = chunk_count,
                                persisted,
                                "chunk count mismatch"
                            );
                        }
                        return Ok(JobOutcome::Complete(persisted));
                    }
                }
            }
            Ok::<_, Error>(JobOutcome::Failed)
        };

        let (produced, consumed) = tokio::join!(scheduler.run(request, tx), consumer);
        let consumed = consumed?;

        match (produced, consumed) {
            (Err(Error::WorkerUnavailable(reason)), JobOutcome::Failed) => {
                debug!(%reason, "scheduler unavailable");
                Ok(JobOutcome::Failed)
            }
            (Err(error), JobOutcome::Failed) => Err(error),
            (_, outcome) => Ok(outcome),
        }
    }

    fn activate(&self, document_id: &str, job_id: JobId) {
        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(document_id.to_string(), job_id);
        if let Some(previous) = previous {
            debug!(document = document_id, job = %previous, "superseded by a newer job");
        }
    }

    fn is_active(&self, document_id: &str, job_id: JobId) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(document_id)
            == Some(&job_id)
    }

    /// Forget `job_id` if it is still the active job. Returns whether it was.
    fn deactivate(&self, document_id: &str, job_id: JobId) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.get(document_id) == Some(&job_id) {
            active.remove(document_id);
            true
        } else {
            false
        }
    }

    /// Clean up after a job that will not complete. Partial chunks are
    /// removed unless a newer job owns the document.
    async fn abandon(&self, document_id: &str, job_id: JobId) -> Result<()> {
        self.deactivate(document_id, job_id);
        let superseded = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(document_id);
        if !superseded {
            self.purge_chunks(document_id).await?;
            self.status.clear(document_id);
        }
        Ok(())
    }

    /// Drop queued backfill for a document and delete its chunks once no
    /// backfill batch is mid-write.
    async fn purge_chunks(&self, document_id: &str) -> Result<()> {
        self.queue.remove(document_id);
        let _gate = self.queue.write_gate().await;
        self.store.delete_chunks_by_document(document_id).await
    }
}

impl std::fmt::Debug for Retriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("scheduler", &self.scheduler.kind())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::ops::ControlFlow;

    use async_trait::async_trait;
    use tokio::sync::{Notify, mpsc::UnboundedSender};

    use super::*;
    use crate::{
        document::Chapter,
        embedding::HashEmbedder,
        scheduler::WorkerScheduler,
        store::test_support::chunk,
        worker::ChunkJob,
    };

    fn fruit_document() -> Document {
        Document {
            id: "fruit".to_string(),
            title: "Fruit".to_string(),
            chapters: vec![
                Chapter {
                    id: "a".to_string(),
                    title: "Apples".to_string(),
                    html: "<p>Apples are crisp.</p>".to_string(),
                },
                Chapter {
                    id: "b".to_string(),
                    title: "Bananas".to_string(),
                    html: "<p>Bananas are sweet.</p>".to_string(),
                },
            ],
        }
    }

    fn long_document(chapters: usize) -> Document {
        Document {
            id: "long".to_string(),
            title: "Long".to_string(),
            chapters: (0..chapters)
                .map(|i| Chapter {
                    id: format!("c{i}"),
                    title: format!("Chapter {i}"),
                    html: (0..8)
                        .map(|p| format!("<p>Chapter {i} paragraph {p} talks about sailing ships.</p>"))
                        .collect(),
                })
                .collect(),
        }
    }

    fn retriever_with(
        scheduler: Arc<dyn Scheduler>,
        embedder: LazyEmbedder,
        config: RetrievalConfig,
    ) -> Retriever {
        Retriever::new(
            Arc::new(MemoryChunkStore::new()),
            scheduler,
            Arc::new(embedder),
            Arc::new(EmbeddingQueue::new()),
            config,
        )
    }

    fn manual_backfill() -> RetrievalConfig {
        RetrievalConfig {
            auto_backfill: false,
            ..RetrievalConfig::default()
        }
    }

    /// Sends a batch tagged with a foreign job id before running the real
    /// job inline.
    struct StaleFirstScheduler;

    #[async_trait]
    impl Scheduler for StaleFirstScheduler {
        fn kind(&self) -> SchedulerKind {
            SchedulerKind::Inline
        }

        async fn run(
            &self,
            request: IndexRequest,
            responses: UnboundedSender<WorkerResponse>,
        ) -> Result<()> {
            let stale = JobId::new();
            let _ = responses.send(WorkerResponse::ChunkBatch {
                job_id: stale,
                chunks: vec![chunk(&request.document.id, "ghost", 99, "ghost text")],
                chapter_index: 1,
                total_chapters: 1,
            });
            let _ = responses.send(WorkerResponse::Complete {
                job_id: stale,
                chunk_count: 1,
            });
            InlineScheduler::default().run(request, responses).await
        }
    }

    /// Pretends to be a worker that dies after the first chapter.
    struct CrashingWorker;

    #[async_trait]
    impl Scheduler for CrashingWorker {
        fn kind(&self) -> SchedulerKind {
            SchedulerKind::Worker
        }

        async fn run(
            &self,
            request: IndexRequest,
            responses: UnboundedSender<WorkerResponse>,
        ) -> Result<()> {
            let mut job = ChunkJob::new(request);
            let _ = job.step(&mut |r: WorkerResponse| {
                let _ = responses.send(r);
                ControlFlow::Continue(())
            });
            Ok(())
        }
    }

    /// Runs the first chapter, then waits for `gate` before finishing.
    struct GatedScheduler {
        gate: Arc<Notify>,
        started: Arc<Notify>,
    }

    #[async_trait]
    impl Scheduler for GatedScheduler {
        fn kind(&self) -> SchedulerKind {
            SchedulerKind::Inline
        }

        async fn run(
            &self,
            request: IndexRequest,
            responses: UnboundedSender<WorkerResponse>,
        ) -> Result<()> {
            let mut emit = |r: WorkerResponse| {
                if responses.send(r).is_ok() {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                }
            };
            let mut job = ChunkJob::new(request);
            if job.step(&mut emit).is_break() {
                return Ok(());
            }
            self.started.notify_one();
            self.gate.notified().await;
            while !job.is_finished() {
                if job.step(&mut emit).is_break() {
                    return Ok(());
                }
            }
            let _ = job.finish(&mut emit);
            Ok(())
        }
    }

    #[tokio::test]
    async fn index_then_search() {
        let retriever = Retriever::in_memory();
        let report = retriever
            .index_document(&fruit_document(), Some(ChunkingOptions::new(30, 40, 5)))
            .await
            .unwrap();

        assert_eq!(report.outcome, IndexOutcome::Indexed { chunk_count: 2 });
        assert_eq!(retriever.state("fruit"), IndexState::ChunkedLexicalReady);

        let results = retriever
            .search("bananas", "fruit", &SearchOptions::default().with_top_k(1))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].chunk.text.contains("Bananas"));
    }

    #[tokio::test]
    async fn indexing_twice_does_not_rechunk() {
        let retriever = Retriever::in_memory();
        let document = fruit_document();
        retriever.index_document(&document, None).await.unwrap();

        let report = retriever.index_document(&document, None).await.unwrap();
        assert_eq!(report.outcome, IndexOutcome::AlreadyIndexed);
        assert_eq!(
            retriever.store().get_chunks_by_document("fruit").await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn indexing_queues_backfill() {
        let retriever = retriever_with(
            Arc::new(InlineScheduler::default()),
            LazyEmbedder::ready(Arc::new(HashEmbedder::new(32))),
            manual_backfill(),
        );
        retriever.index_document(&fruit_document(), None).await.unwrap();
        assert_eq!(retriever.queue().pending(), vec!["fruit"]);

        assert_eq!(retriever.drain_backfill().await, 1);
        assert!(retriever.queue().is_empty());
        assert_eq!(retriever.state("fruit"), IndexState::FullyIndexed);

        let outcome = retriever
            .search_outcome("bananas", "fruit", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.method, search::RankingMethod::Hybrid);
    }

    #[tokio::test]
    async fn generate_embeddings_off_skips_queue() {
        let retriever = retriever_with(
            Arc::new(InlineScheduler::default()),
            LazyEmbedder::ready(Arc::new(HashEmbedder::new(32))),
            RetrievalConfig {
                generate_embeddings: false,
                ..manual_backfill()
            },
        );
        retriever.index_document(&fruit_document(), None).await.unwrap();
        assert!(retriever.queue().is_empty());

        // Searching still notices the gap.
        retriever
            .search("apples", "fruit", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(retriever.queue().pending(), vec!["fruit"]);
    }

    #[tokio::test]
    async fn empty_document_produces_nothing() {
        let retriever = Retriever::in_memory();
        let document = Document::from_markup("empty", "Empty", "<p>   </p>");
        let err = retriever.index_document(&document, None).await.unwrap_err();
        assert!(matches!(err, Error::ChunkingProducedNothing { .. }));
        assert_eq!(retriever.state("empty"), IndexState::NotIndexed);
    }

    #[tokio::test]
    async fn invalid_options_are_rejected() {
        let retriever = Retriever::in_memory();
        let err = retriever
            .index_document(&fruit_document(), Some(ChunkingOptions::new(10, 5, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn stale_messages_are_ignored() {
        let retriever = retriever_with(
            Arc::new(StaleFirstScheduler),
            LazyEmbedder::unavailable(),
            manual_backfill(),
        );
        let report = retriever.index_document(&fruit_document(), None).await.unwrap();
        assert_eq!(report.outcome, IndexOutcome::Indexed { chunk_count: 2 });

        let ghost = retriever.get_chunk_by_id("fruit-ghost-chunk-99").await.unwrap();
        assert!(ghost.is_none());
    }

    #[tokio::test]
    async fn worker_and_inline_persist_identical_chunks() {
        let document = long_document(7);
        let options = Some(ChunkingOptions::new(12, 16, 4));

        let worker = retriever_with(
            Arc::new(WorkerScheduler::spawn().unwrap()),
            LazyEmbedder::unavailable(),
            manual_backfill(),
        );
        let inline = retriever_with(
            Arc::new(InlineScheduler::default()),
            LazyEmbedder::unavailable(),
            manual_backfill(),
        );
        worker.index_document(&document, options).await.unwrap();
        inline.index_document(&document, options).await.unwrap();

        let a = worker.store().get_chunks_by_document("long").await.unwrap();
        let b = inline.store().get_chunks_by_document("long").await.unwrap();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn crashed_worker_falls_back_to_inline() {
        let document = long_document(4);
        let options = Some(ChunkingOptions::new(12, 16, 4));

        let crashing = retriever_with(
            Arc::new(CrashingWorker),
            LazyEmbedder::unavailable(),
            manual_backfill(),
        );
        let report = crashing.index_document(&document, options).await.unwrap();

        let reference = Retriever::in_memory();
        let expected = reference.index_document(&document, options).await.unwrap();
        assert_eq!(report.outcome, expected.outcome);

        let a = crashing.store().get_chunks_by_document("long").await.unwrap();
        let b = reference.store().get_chunks_by_document("long").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn cancel_discards_job() {
        let gate = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let retriever = Arc::new(retriever_with(
            Arc::new(GatedScheduler {
                gate: gate.clone(),
                started: started.clone(),
            }),
            LazyEmbedder::unavailable(),
            RetrievalConfig {
                chunk_batch_size: 1,
                ..manual_backfill()
            },
        ));

        let task = {
            let retriever = retriever.clone();
            tokio::spawn(async move {
                retriever
                    .index_document(&long_document(3), Some(ChunkingOptions::new(12, 16, 4)))
                    .await
            })
        };

        started.notified().await;
        assert!(retriever.cancel("long"));
        gate.notify_one();

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.outcome, IndexOutcome::Cancelled);
        assert!(!retriever.store().has_chunks("long").await.unwrap());
        assert_eq!(retriever.state("long"), IndexState::NotIndexed);
    }

    #[tokio::test]
    async fn reindex_replaces_chunks() {
        let retriever = Retriever::in_memory();
        let words: Vec<String> = (0..220).map(|i| format!("word{i}")).collect();
        let document = Document::from_markup("d", "D", words.join(" "));

        retriever
            .index_document(&document, Some(ChunkingOptions::new(80, 100, 10)))
            .await
            .unwrap();
        let before = retriever.store().get_chunks_by_document("d").await.unwrap().len();

        retriever
            .reindex_document(&document, Some(ChunkingOptions::new(20, 25, 5)))
            .await
            .unwrap();
        let after = retriever.store().get_chunks_by_document("d").await.unwrap().len();

        assert!(after > before, "{after} should exceed {before}");
    }

    #[tokio::test]
    async fn remove_document_clears_everything() {
        let retriever = retriever_with(
            Arc::new(InlineScheduler::default()),
            LazyEmbedder::ready(Arc::new(HashEmbedder::new(16))),
            manual_backfill(),
        );
        retriever.index_document(&fruit_document(), None).await.unwrap();
        assert!(retriever.queue().contains("fruit"));

        retriever.remove_document("fruit").await.unwrap();
        assert!(retriever.queue().is_empty());
        assert_eq!(retriever.state("fruit"), IndexState::NotIndexed);
        let err = retriever
            .search("apples", "fruit", &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotIndexed { .. }));
    }

    #[tokio::test]
    async fn progress_reaches_lexical_ready() {
        let retriever = Retriever::in_memory();
        let rx = retriever.progress();
        retriever.index_document(&long_document(2), None).await.unwrap();

        let latest = rx.borrow().clone().unwrap();
        assert_eq!(latest.document_id, "long");
        assert_eq!(latest.state, IndexState::ChunkedLexicalReady);
        assert_eq!(latest.percent, 100);
    }

    #[tokio::test]
    async fn get_chunk_by_id() {
        let retriever = Retriever::in_memory();
        retriever.index_document(&fruit_document(), None).await.unwrap();

        let chunk = retriever.get_chunk_by_id("fruit-b-chunk-1").await.unwrap().unwrap();
        assert_eq!(chunk.text, "Bananas are sweet.");
        assert!(retriever.get_chunk_by_id("nope").await.unwrap().is_none());
    }
}
