//! The chunk-streaming job run by both schedulers.
//!
//! [`ChunkJob`] processes one chapter per [`ChunkJob::step`] so that the
//! inline scheduler can yield between chapters while the worker thread runs
//! the same steps back to back. Both paths therefore produce identical
//! message sequences.

use std::ops::ControlFlow;

use tracing::debug;

use crate::{
    chunking::{ChunkingOptions, chunk_markup},
    document::{Chapter, Chunk},
    protocol::{IndexRequest, JobId, WorkerResponse},
};

pub struct ChunkJob {
    job_id: JobId,
    document_id: String,
    chapters: Vec<Chapter>,
    options: ChunkingOptions,
    batch_size: usize,
    next_chapter: usize,
    chunk_count: usize,
    batch: Vec<Chunk>,
}

impl ChunkJob {
    pub fn new(request: IndexRequest) -> Self {
        let batch_size = request.effective_batch_size();
        Self {
            job_id: request.job_id,
            document_id: request.document.id,
            chapters: request.document.chapters,
            options: request.options,
            batch_size,
            next_chapter: 0,
            chunk_count: 0,
            batch: Vec::with_capacity(batch_size),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn total_chapters(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_finished(&self) -> bool {
        self.next_chapter >= self.chapters.len()
    }

    /// Chunk the next chapter, emitting full batches as they fill up and a
    /// progress message once the chapter is done.
    pub fn step(
        &mut self,
        emit: &mut impl FnMut(WorkerResponse) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        let Some(chapter) = self.chapters.get(self.next_chapter) else {
            return ControlFlow::Continue(());
        };
        let chapter_number = self.next_chapter + 1;
        let total = self.chapters.len();

        for raw in chunk_markup(&chapter.html, &self.options) {
            self.batch.push(Chunk::from_raw(
                raw,
                &self.document_id,
                chapter,
                self.chunk_count,
            ));
            self.chunk_count += 1;

            if self.batch.len() >= self.batch_size {
                let chunks = std::mem::replace(
                    &mut self.batch,
                    Vec::with_capacity(self.batch_size),
                );
                emit(WorkerResponse::ChunkBatch {
                    job_id: self.job_id,
                    chunks,
                    chapter_index: chapter_number,
                    total_chapters: total,
                })?;
            }
        }

        self.next_chapter += 1;
        emit(WorkerResponse::Progress {
            job_id: self.job_id,
            current: chapter_number,
            total,
        })
    }

    /// Flush the last partial batch and emit `complete`.
    pub fn finish(
        mut self,
        emit: &mut impl FnMut(WorkerResponse) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        let total = self.chapters.len();
        if !self.batch.is_empty() {
            emit(WorkerResponse::ChunkBatch {
                job_id: self.job_id,
                chunks: std::mem::take(&mut self.batch),
                chapter_index: total,
                total_chapters: total,
            })?;
        }

        debug!(
            job = %self.job_id,
            document = %self.document_id,
            chunks = self.chunk_count,
            "chunking job finished"
        );
        emit(WorkerResponse::Complete {
            job_id: self.job_id,
            chunk_count: self.chunk_count,
        })
    }
}

/// Run a whole job without interruption.
///
/// `emit` receives each response as it is produced. Returning
/// [`ControlFlow::Break`] abandons the job.
pub fn stream_chunks(
    request: IndexRequest,
    mut emit: impl FnMut(WorkerResponse) -> ControlFlow<()>,
) -> ControlFlow<()> {
    let mut job = ChunkJob::new(request);
    while !job.is_finished() {
        job.step(&mut emit)?;
    }
    job.finish(&mut emit)
}
