//! Where chunking runs: a dedicated worker thread, or inline on the calling
//! task with cooperative yields.
//!
//! The choice is made once, at startup, by [`select_scheduler`]. Both
//! implementations drive the same [`ChunkJob`], so chunk boundaries and
//! message order do not depend on which one was picked.

use std::{
    fmt,
    ops::ControlFlow,
    sync::{Arc, Mutex, PoisonError, mpsc},
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    protocol::{self, IndexRequest, WorkerRequest, WorkerResponse},
    worker::{ChunkJob, stream_chunks},
};

/// Chapters processed between yields on the inline path.
pub const DEFAULT_YIELD_EVERY: usize = 3;

const WORKER_THREAD_NAME: &str = "bookbert-indexer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Worker,
    Inline,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker => write!(f, "worker"),
            Self::Inline => write!(f, "inline"),
        }
    }
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    fn kind(&self) -> SchedulerKind;

    /// Run one chunking job, forwarding every response to `responses`.
    ///
    /// Returns once the job has finished or the receiving side has gone
    /// away. A job that stops without sending `complete` has failed; the
    /// caller decides what to do about it.
    async fn run(
        &self,
        request: IndexRequest,
        responses: UnboundedSender<WorkerResponse>,
    ) -> Result<()>;
}

struct WorkerJob {
    request: String,
    replies: UnboundedSender<String>,
}

/// Runs jobs FIFO on one long-lived OS thread.
///
/// Requests and responses cross the thread boundary as JSON, exactly as
/// they would cross a process boundary, and responses are validated on the
/// way back in.
pub struct WorkerScheduler {
    jobs: Mutex<Option<mpsc::Sender<WorkerJob>>>,
}

impl WorkerScheduler {
    /// Start the indexing thread.
    pub fn spawn() -> Result<Self> {
        let (tx, rx) = mpsc::channel::<WorkerJob>();
        std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || worker_loop(rx))?;

        Ok(Self {
            jobs: Mutex::new(Some(tx)),
        })
    }

    /// Stop accepting jobs. The thread exits after the current one.
    pub fn shutdown(&self) {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn submit(&self, job: WorkerJob) -> Result<()> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = jobs.as_ref().ok_or_else(|| {
            Error::WorkerUnavailable("indexing thread was shut down".to_string())
        })?;
        sender.send(job).map_err(|_| {
            Error::WorkerUnavailable("indexing thread has stopped".to_string())
        })
    }
}

fn worker_loop(jobs: mpsc::Receiver<WorkerJob>) {
    while let Ok(job) = jobs.recv() {
        let request = match protocol::decode_request(&job.request) {
            Ok(WorkerRequest::Index(request)) => request,
            Err(error) => {
                warn!(%error, "indexing thread received a malformed request");
                continue;
            }
        };

        let job_id = request.job_id;
        debug!(job = %job_id, "indexing thread picked up job");

        let flow = stream_chunks(request, |response| {
            match protocol::encode_response(&response) {
                Ok(raw) => match job.replies.send(raw) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(_) => ControlFlow::Break(()),
                },
                Err(error) => {
                    warn!(%error, "failed to encode worker response");
                    ControlFlow::Break(())
                }
            }
        });

        if flow.is_break() {
            debug!(job = %job_id, "listener gone, job abandoned");
        }
    }
    debug!("indexing thread exiting");
}

#[async_trait]
impl Scheduler for WorkerScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Worker
    }

    async fn run(
        &self,
        request: IndexRequest,
        responses: UnboundedSender<WorkerResponse>,
    ) -> Result<()> {
        let raw = protocol::encode_request(&WorkerRequest::Index(request))?;
        let (replies, mut incoming) = unbounded_channel();
        self.submit(WorkerJob {
            request: raw,
            replies,
        })?;

        while let Some(raw) = incoming.recv().await {
            match protocol::decode_response(&raw) {
                Ok(response) => {
                    if responses.send(response).is_err() {
                        break;
                    }
                }
                Err(error) => warn!(%error, "dropping invalid worker message"),
            }
        }
        Ok(())
    }
}

/// Runs jobs on the calling task, yielding every `yield_every` chapters.
#[derive(Debug, Clone)]
pub struct InlineScheduler {
    pub yield_every: usize,
}

impl Default for InlineScheduler {
    fn default() -> Self {
        Self {
            yield_every: DEFAULT_YIELD_EVERY,
        }
    }
}

#[async_trait]
impl Scheduler for InlineScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Inline
    }

    async fn run(
        &self,
        request: IndexRequest,
        responses: UnboundedSender<WorkerResponse>,
    ) -> Result<()> {
        let mut emit = |response: WorkerResponse| {
            if responses.send(response).is_ok() {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            }
        };

        let mut job = ChunkJob::new(request);
        let yield_every = self.yield_every.max(1);
        let mut since_yield = 0;

        while !job.is_finished() {
            if job.step(&mut emit).is_break() {
                return Ok(());
            }
            since_yield += 1;
            if since_yield >= yield_every {
                since_yield = 0;
                tokio::task::yield_now().await;
            }
        }

        let _ = job.finish(&mut emit);
        Ok(())
    }
}

/// Pick the scheduler for this process.
///
/// Falls back to [`InlineScheduler`] when the worker thread cannot be
/// started.
pub fn select_scheduler(
    prefer_worker: bool,
    yield_every: usize,
) -> Arc<dyn Scheduler> {
    let inline = || Arc::new(InlineScheduler { yield_every }) as Arc<dyn Scheduler>;

    let scheduler = if prefer_worker {
        match WorkerScheduler::spawn() {
            Ok(worker) => Arc::new(worker) as Arc<dyn Scheduler>,
            Err(error) => {
                warn!(%error, "could not start indexing thread, chunking inline");
                inline()
            }
        }
    } else {
        inline()
    };

    debug!(scheduler = %scheduler.kind(), "indexing scheduler selected");
    scheduler
}
