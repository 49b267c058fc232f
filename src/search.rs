use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    document::Chunk,
    embedding::{LazyEmbedder, SharedProvider},
    error::{Error, Result},
    ranking::{self, SearchResult},
    store::ChunkStore,
};

/// Results returned when no count is given.
pub const DEFAULT_TOP_K: usize = 12;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
    Chapter,
    #[default]
    WholeDocument,
}

impl fmt::Display for SearchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chapter => write!(f, "chapter"),
            Self::WholeDocument => write!(f, "whole-document"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    pub scope: SearchScope,
    /// Required for [`SearchScope::Chapter`]; ignored otherwise.
    pub chapter_id: Option<String>,
    pub top_k: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self::whole_document()
    }
}

impl SearchOptions {
    pub fn whole_document() -> Self {
        Self {
            scope: SearchScope::WholeDocument,
            chapter_id: None,
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn chapter(chapter_id: impl Into<String>) -> Self {
        Self {
            scope: SearchScope::Chapter,
            chapter_id: Some(chapter_id.into()),
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }
}

/// Which ranking produced a result list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingMethod {
    /// BM25 only.
    Lexical,
    /// BM25 and embedding rankings fused with RRF.
    Hybrid,
}

impl fmt::Display for RankingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lexical => write!(f, "lexical"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub method: RankingMethod,
    /// An embedding provider is available but some candidates have no
    /// vector from it yet.
    pub needs_backfill: bool,
}

/// Run one search over a document.
///
/// 1. Load the candidates for the requested scope
/// 2. Rank them with BM25
/// 3. If every candidate has an embedding from the available provider,
///    embed the query and fuse both rankings
/// 4. Keep the top `top_k`
///
/// An empty candidate set is [`Error::NotIndexed`], so "never indexed" and
/// "nothing matched" stay distinguishable. Missing embeddings never fail a
/// search: the result is lexical and `needs_backfill` is set.
pub async fn execute_search(
    query: &str,
    document_id: &str,
    options: &SearchOptions,
    store: &dyn ChunkStore,
    embedder: &LazyEmbedder,
    rrf_k: u32,
) -> Result<SearchOutcome> {
    let candidates = load_candidates(document_id, options, store).await?;
    if candidates.is_empty() {
        return Err(Error::NotIndexed {
            document_id: document_id.to_string(),
            scope: options.scope,
        });
    }

    let lexical = ranking::rank_by_bm25(query, &candidates);

    let Some(provider) = embedder.get().await else {
        return Ok(lexical_outcome(lexical, options.top_k, false));
    };

    let model = provider.model().to_string();
    if !candidates.iter().all(|c| c.has_embedding_from(&model)) {
        debug!(document = document_id, "embeddings incomplete, lexical only");
        return Ok(lexical_outcome(lexical, options.top_k, true));
    }

    let query_vector = match embed_query(&provider, query).await {
        Ok(vector) => vector,
        Err(error) => {
            warn!(%error, "query embedding failed, lexical only");
            return Ok(lexical_outcome(lexical, options.top_k, false));
        }
    };

    let semantic = ranking::rank_by_embeddings(&query_vector, &model, &candidates);
    let mut results = ranking::fuse(&[semantic, lexical], rrf_k);
    results.truncate(options.top_k);

    Ok(SearchOutcome {
        results,
        method: RankingMethod::Hybrid,
        needs_backfill: false,
    })
}

async fn load_candidates(
    document_id: &str,
    options: &SearchOptions,
    store: &dyn ChunkStore,
) -> Result<Vec<Chunk>> {
    match options.scope {
        SearchScope::WholeDocument => store.get_chunks_by_document(document_id).await,
        SearchScope::Chapter => match &options.chapter_id {
            Some(chapter_id) => {
                store
                    .get_chunks_by_document_chapter(document_id, chapter_id)
                    .await
            }
            None => Ok(Vec::new()),
        },
    }
}

fn lexical_outcome(
    mut results: Vec<SearchResult>,
    top_k: usize,
    needs_backfill: bool,
) -> SearchOutcome {
    results.truncate(top_k);
    SearchOutcome {
        results,
        method: RankingMethod::Lexical,
        needs_backfill,
    }
}

async fn embed_query(provider: &SharedProvider, query: &str) -> Result<Vec<f32>> {
    let provider = provider.clone();
    let texts = vec![query.to_string()];
    let vectors = tokio::task::spawn_blocking(move || provider.embed(&texts))
        .await
        .map_err(|e| Error::Embedding(format!("query embedding task failed: {e}")))??;

    vectors
        .into_iter()
        .next()
        .ok_or_else(|| Error::Embedding("provider returned no query vector".to_string()))
}

const SNIPPET_CHARS: usize = 160;

/// Format results for human-readable terminal output.
pub fn format_human(outcome: &SearchOutcome) -> String {
    if outcome.results.is_empty() {
        return "No results found.\n".to_string();
    }

    let mut out = String::new();
    for (i, r) in outcome.results.iter().enumerate() {
        out.push_str(&format!(
            "{:>3}. [{:.3}] {} #{}\n",
            i + 1,
            r.score,
            r.chunk.chapter_title,
            r.chunk.id
        ));
        out.push_str(&format!("     {}\n", snippet(&r.chunk.text)));
    }
    out.push_str(&format!(
        "\n{} result(s), {} ranking\n",
        outcome.results.len(),
        outcome.method
    ));
    out
}

/// Format results as a JSON document.
pub fn format_json(query: &str, outcome: &SearchOutcome) -> Result<String> {
    let results: Vec<serde_json::Value> = outcome
        .results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            serde_json::json!({
                "rank": i + 1,
                "score": r.score,
                "id": r.chunk.id,
                "documentId": r.chunk.document_id,
                "chapterId": r.chunk.chapter_id,
                "chapterTitle": r.chunk.chapter_title,
                "text": r.chunk.text,
            })
        })
        .collect();

    Ok(serde_json::to_string(&serde_json::json!({
        "query": query,
        "method": outcome.method,
        "needsBackfill": outcome.needs_backfill,
        "resultCount": results.len(),
        "results": results,
    }))?)
}

fn snippet(text: &str) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= SNIPPET_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(SNIPPET_CHARS).collect();
    format!("{}...", cut.trim_end())
}
