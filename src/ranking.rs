use std::{cmp::Ordering, collections::HashMap};

use rayon::prelude::*;
use serde::Serialize;

use crate::{bm25::Bm25Index, document::Chunk};

/// Reciprocal-rank-fusion smoothing constant.
pub const DEFAULT_RRF_K: u32 = 60;

/// A chunk with the score of whichever ranking produced it.
///
/// Scores from different ranking methods are not comparable; only the order
/// within one list means anything.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub score: f32,
}

/// Cosine similarity, 0 when lengths differ or either vector is zero.
///
/// # Examples
///
/// ```
/// use bookbert::ranking::cosine_similarity;
///
/// assert_eq!(cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]), 1.0);
/// assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]), 0.0);
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Rank chunks by cosine similarity to a query vector from `model`.
///
/// Chunks without an embedding from the same model score 0 but are kept.
pub fn rank_by_embeddings(
    query_vector: &[f32],
    model: &str,
    chunks: &[Chunk],
) -> Vec<SearchResult> {
    let scored: Vec<SearchResult> = chunks
        .par_iter()
        .map(|chunk| {
            let score = match &chunk.embedding {
                Some(vector) if chunk.embedding_model.as_deref() == Some(model) => {
                    cosine_similarity(query_vector, vector)
                }
                _ => 0.0,
            };
            SearchResult {
                chunk: chunk.clone(),
                score,
            }
        })
        .collect();

    sort_descending(scored)
}

/// Rank chunks by BM25 against an index built over exactly these chunks.
pub fn rank_by_bm25(query: &str, chunks: &[Chunk]) -> Vec<SearchResult> {
    let index = Bm25Index::build(chunks);
    let scores = index.score_batch(query, chunks);

    let scored = chunks
        .iter()
        .zip(scores)
        .map(|(chunk, score)| SearchResult {
            chunk: chunk.clone(),
            score: score as f32,
        })
        .collect();

    sort_descending(scored)
}

/// Reciprocal-rank fusion.
///
/// Each list contributes `1 / (k + rank + 1)` for every chunk it contains,
/// with `rank` 0-based. Contributions are summed per chunk id. The output
/// holds the union of all input chunks, highest fused score first; ties keep
/// the order in which chunks were first seen.
pub fn fuse(rankings: &[Vec<SearchResult>], k: u32) -> Vec<SearchResult> {
    let mut fused: Vec<SearchResult> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();

    for ranking in rankings {
        for (rank, result) in ranking.iter().enumerate() {
            let contribution = 1.0 / (k as f32 + rank as f32 + 1.0);
            match position.get(result.chunk.id.as_str()) {
                Some(&i) => fused[i].score += contribution,
                None => {
                    position.insert(result.chunk.id.as_str(), fused.len());
                    fused.push(SearchResult {
                        chunk: result.chunk.clone(),
                        score: contribution,
                    });
                }
            }
        }
    }

    sort_descending(fused)
}

/// Stable sort, highest score first.
fn sort_descending(mut results: Vec<SearchResult>) -> Vec<SearchResult> {
    results.sort_by(|a, b| {
        b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal)
    });
    results
}
