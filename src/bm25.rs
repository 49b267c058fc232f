//! Okapi BM25 over a chunk set.
//!
//! The index is rebuilt for every search against the candidate set being
//! searched (a whole document or a single chapter). Per-document corpora are
//! small enough that this costs less than keeping an incremental index in
//! sync.

use std::collections::{HashMap, HashSet};

use crate::{document::Chunk, tokenizer::tokenize};

pub const DEFAULT_K1: f64 = 1.5;
pub const DEFAULT_B: f64 = 0.75;

/// Document-frequency statistics for one candidate set.
#[derive(Debug, Clone, PartialEq)]
pub struct Bm25Index {
    pub k1: f64,
    pub b: f64,
    /// Mean token count per chunk, 0 for an empty set.
    pub avg_doc_length: f64,
    pub doc_count: usize,
    /// Term -> number of chunks containing it at least once.
    pub term_doc_freq: HashMap<String, usize>,
}

impl Bm25Index {
    /// Build statistics over the given chunks.
    ///
    /// # Examples
    ///
    /// ```
    /// use bookbert::bm25::Bm25Index;
    ///
    /// let index = Bm25Index::build_from_texts(["red fish", "blue fish fish"]);
    /// assert_eq!(index.doc_count, 2);
    /// assert_eq!(index.avg_doc_length, 2.5);
    /// assert_eq!(index.term_doc_freq["fish"], 2);
    /// ```
    pub fn build(chunks: &[Chunk]) -> Self {
        Self::build_from_texts(chunks.iter().map(|c| c.text.as_str()))
    }

    pub fn build_from_texts<'a>(
        texts: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut term_doc_freq: HashMap<String, usize> = HashMap::new();
        let mut total_tokens = 0usize;
        let mut doc_count = 0usize;

        for text in texts {
            let tokens = tokenize(text);
            total_tokens += tokens.len();
            doc_count += 1;

            let unique: HashSet<String> = tokens.into_iter().collect();
            for token in unique {
                *term_doc_freq.entry(token).or_insert(0) += 1;
            }
        }

        let avg_doc_length = if doc_count == 0 {
            0.0
        } else {
            total_tokens as f64 / doc_count as f64
        };

        Self {
            k1: DEFAULT_K1,
            b: DEFAULT_B,
            avg_doc_length,
            doc_count,
            term_doc_freq,
        }
    }

    /// Override the saturation (`k1`) and length normalisation (`b`)
    /// parameters.
    pub fn with_params(mut self, k1: f64, b: f64) -> Self {
        self.k1 = k1;
        self.b = b;
        self
    }

    pub fn idf(&self, term: &str) -> f64 {
        let df = self.term_doc_freq.get(term).copied().unwrap_or(0) as f64;
        (1.0 + (self.doc_count as f64 - df + 0.5) / (df + 0.5)).ln()
    }

    /// Score a single text against a query.
    pub fn score(&self, query: &str, text: &str) -> f64 {
        let terms = query_terms(query);
        if terms.is_empty() || self.doc_count == 0 {
            return 0.0;
        }
        self.score_terms(&terms, text)
    }

    /// Score every chunk against a query, in input order.
    ///
    /// An empty query or an empty index scores every chunk 0.
    pub fn score_batch(&self, query: &str, chunks: &[Chunk]) -> Vec<f64> {
        let terms = query_terms(query);
        if terms.is_empty() || self.doc_count == 0 {
            return vec![0.0; chunks.len()];
        }
        chunks
            .iter()
            .map(|chunk| self.score_terms(&terms, &chunk.text))
            .collect()
    }

    fn score_terms(&self, terms: &[String], text: &str) -> f64 {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return 0.0;
        }

        let mut term_counts: HashMap<&str, usize> = HashMap::new();
        for token in &tokens {
            *term_counts.entry(token.as_str()).or_insert(0) += 1;
        }

        let doc_length = tokens.len() as f64;
        let avg_doc_length = if self.avg_doc_length == 0.0 {
            1.0
        } else {
            self.avg_doc_length
        };

        // Summed in query order, so identical inputs give identical bits.
        let mut score = 0.0;
        for term in terms {
            let tf = term_counts.get(term.as_str()).copied().unwrap_or(0) as f64;
            if tf == 0.0 {
                continue;
            }
            let denom = tf
                + self.k1
                    * (1.0 - self.b + self.b * (doc_length / avg_doc_length));
            score += self.idf(term) * (tf * (self.k1 + 1.0)) / denom;
        }
        score
    }
}

/// Unique query tokens in first-occurrence order.
fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(query)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}
