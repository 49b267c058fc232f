//! Messages exchanged with the background indexing worker.
//!
//! Requests and responses are JSON on the wire. Responses are validated on
//! receipt and never trusted just because they parsed.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    chunking::ChunkingOptions,
    document::{Chapter, Chunk, Document},
    error::{Error, Result},
};

/// Default number of chunks per `chunk_batch` message.
pub const DEFAULT_CHUNK_BATCH_SIZE: usize = 50;

/// Correlates worker responses with the job that requested them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The parts of a document the worker needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPayload {
    pub id: String,
    pub chapters: Vec<Chapter>,
}

impl From<&Document> for DocumentPayload {
    fn from(document: &Document) -> Self {
        Self {
            id: document.id.clone(),
            chapters: document.chapters.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRequest {
    pub job_id: JobId,
    pub document: DocumentPayload,
    pub options: ChunkingOptions,
    pub chunk_batch_size: usize,
}

impl IndexRequest {
    pub fn new(
        document: &Document,
        options: ChunkingOptions,
        chunk_batch_size: usize,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            document: document.into(),
            options,
            chunk_batch_size,
        }
    }

    /// The batch size actually used; non-positive sizes fall back to the
    /// default.
    pub fn effective_batch_size(&self) -> usize {
        if self.chunk_batch_size == 0 {
            DEFAULT_CHUNK_BATCH_SIZE
        } else {
            self.chunk_batch_size
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Index(IndexRequest),
}

impl WorkerRequest {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Index(request) => request.job_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum WorkerResponse {
    /// Chunks ready to persist. `chapter_index` is 1-based: the number of
    /// chapters fully or partly covered so far.
    ChunkBatch {
        job_id: JobId,
        chunks: Vec<Chunk>,
        chapter_index: usize,
        total_chapters: usize,
    },
    /// Emitted once per chapter, after that chapter's chunks.
    Progress {
        job_id: JobId,
        current: usize,
        total: usize,
    },
    /// Terminal message of a job.
    Complete { job_id: JobId, chunk_count: usize },
}

impl WorkerResponse {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::ChunkBatch { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Complete { job_id, .. } => *job_id,
        }
    }

    /// Reject messages whose shape parses but whose contents are nonsense.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::ChunkBatch {
                chunks,
                chapter_index,
                total_chapters,
                ..
            } => {
                if chunks.is_empty() {
                    return Err(Error::Protocol("empty chunk batch".to_string()));
                }
                if chapter_index > total_chapters {
                    return Err(Error::Protocol(format!(
                        "chapter index {chapter_index} exceeds total {total_chapters}"
                    )));
                }
            }
            Self::Progress { current, total, .. } => {
                if current > total {
                    return Err(Error::Protocol(format!(
                        "progress {current} exceeds total {total}"
                    )));
                }
            }
            Self::Complete { .. } => {}
        }
        Ok(())
    }
}

pub fn encode_request(request: &WorkerRequest) -> Result<String> {
    Ok(serde_json::to_string(request)?)
}

pub fn decode_request(raw: &str) -> Result<WorkerRequest> {
    serde_json::from_str(raw).map_err(|e| Error::Protocol(e.to_string()))
}

pub fn encode_response(response: &WorkerResponse) -> Result<String> {
    Ok(serde_json::to_string(response)?)
}

/// Parse and validate a response received from the worker.
pub fn decode_response(raw: &str) -> Result<WorkerResponse> {
    let response: WorkerResponse =
        serde_json::from_str(raw).map_err(|e| Error::Protocol(e.to_string()))?;
    response.validate()?;
    Ok(response)
}
