use std::{
    collections::HashMap,
    fmt,
    sync::{Mutex, PoisonError},
};

use serde::Serialize;
use tokio::sync::watch;

/// Indexing lifecycle of one document.
///
/// A document is searchable lexically from [`IndexState::ChunkedLexicalReady`]
/// onwards. Embedding backfill only adds to that and never blocks search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    NotIndexed,
    Chunking,
    ChunkedLexicalReady,
    EmbeddingBackfill,
    FullyIndexed,
}

impl IndexState {
    pub fn is_searchable(self) -> bool {
        matches!(
            self,
            Self::ChunkedLexicalReady | Self::EmbeddingBackfill | Self::FullyIndexed
        )
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotIndexed => "not indexed",
            Self::Chunking => "chunking",
            Self::ChunkedLexicalReady => "lexical ready",
            Self::EmbeddingBackfill => "embedding backfill",
            Self::FullyIndexed => "fully indexed",
        };
        f.write_str(s)
    }
}

/// The latest progress report, as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexProgress {
    pub document_id: String,
    pub state: IndexState,
    /// 0..=100 within the current state.
    pub percent: u8,
}

/// Rounded percentage of `done` out of `total`; an empty total is complete.
pub fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let value = (done.min(total) as f64 / total as f64 * 100.0).round();
    value as u8
}

/// Per-document states plus a `watch` channel carrying the most recent
/// progress report.
pub struct StatusBoard {
    states: Mutex<HashMap<String, IndexState>>,
    progress: watch::Sender<Option<IndexProgress>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (progress, _) = watch::channel(None);
        Self {
            states: Mutex::new(HashMap::new()),
            progress,
        }
    }

    pub fn state(&self, document_id: &str) -> IndexState {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(document_id)
            .copied()
            .unwrap_or(IndexState::NotIndexed)
    }

    /// Enter `state` at 0% (100% for terminal states).
    pub fn set(&self, document_id: &str, state: IndexState) {
        let start = match state {
            IndexState::ChunkedLexicalReady | IndexState::FullyIndexed => 100,
            _ => 0,
        };
        self.report(document_id, state, start);
    }

    pub fn report(&self, document_id: &str, state: IndexState, percent: u8) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(document_id.to_string(), state);
        self.progress.send_replace(Some(IndexProgress {
            document_id: document_id.to_string(),
            state,
            percent: percent.min(100),
        }));
    }

    /// Forget a document entirely.
    pub fn clear(&self, document_id: &str) {
        let removed = self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(document_id);
        if removed.is_some() {
            self.progress.send_replace(Some(IndexProgress {
                document_id: document_id.to_string(),
                state: IndexState::NotIndexed,
                percent: 0,
            }));
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<IndexProgress>> {
        self.progress.subscribe()
    }

    /// All known documents and their states, sorted by id.
    pub fn snapshot(&self) -> Vec<(String, IndexState)> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> =
            states.iter().map(|(k, v)| (k.clone(), *v)).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

impl fmt::Debug for StatusBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusBoard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_documents_are_not_indexed() {
        let board = StatusBoard::new();
        assert_eq!(board.state("x"), IndexState::NotIndexed);
        assert!(!board.state("x").is_searchable());
    }

    #[test]
    fn set_and_report_publish_progress() {
        let board = StatusBoard::new();
        let rx = board.subscribe();

        board.set("doc", IndexState::Chunking);
        board.report("doc", IndexState::Chunking, 40);
        assert_eq!(board.state("doc"), IndexState::Chunking);
        assert_eq!(
            *rx.borrow(),
            Some(IndexProgress {
                document_id: "doc".to_string(),
                state: IndexState::Chunking,
                percent: 40,
            })
        );

        board.set("doc", IndexState::ChunkedLexicalReady);
        assert!(board.state("doc").is_searchable());
        assert_eq!(rx.borrow().as_ref().map(|p| p.percent), Some(100));
    }

    #[test]
    fn clear_forgets_document() {
        let board = StatusBoard::new();
        board.set("a", IndexState::FullyIndexed);
        board.set("b", IndexState::Chunking);
        board.clear("a");

        assert_eq!(board.state("a"), IndexState::NotIndexed);
        assert_eq!(
            board.snapshot(),
            vec![("b".to_string(), IndexState::Chunking)]
        );
    }

    #[test]
    fn percent_rounds_and_clamps() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 67);
        assert_eq!(percent(5, 3), 100);
    }

    #[test]
    fn progress_is_visible_without_subscribers() {
        let board = StatusBoard::new();
        board.report("doc", IndexState::EmbeddingBackfill, 50);
        let rx = board.subscribe();
        assert_eq!(rx.borrow().as_ref().map(|p| p.percent), Some(50));
    }
}
