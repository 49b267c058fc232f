//! Splitting chapters into overlapping, token-bounded passages.
//!
//! Paragraphs are packed greedily up to a soft target size. When a chunk is
//! closed, its trailing paragraphs are carried into the next chunk as
//! context. Paragraphs larger than the hard ceiling are split by sentence,
//! and sentences that are still too large are cut into raw word windows,
//! which always terminates.
//!
//! Offsets on [`RawChunk`] are running token counts, except inside word
//! windows where they count words. They exist for overlap bookkeeping only
//! and do not map back to byte positions in the source.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    paragraphs::extract_paragraphs,
    tokenizer::{estimate_token_count, split_into_paragraphs, token_spans},
};

/// Default soft chunk size in tokens.
pub const DEFAULT_TARGET_TOKENS: usize = 400;

/// Default hard ceiling in tokens before a paragraph is force-split.
pub const DEFAULT_MAX_TOKENS: usize = 500;

/// Default number of trailing tokens carried into the next chunk.
pub const DEFAULT_OVERLAP_TOKENS: usize = 100;

static SENTENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^.!?]*[.!?]+|[^.!?]+$").expect("sentence pattern is valid")
});

/// Chunk sizing, measured in [`estimate_token_count`] tokens.
///
/// Must satisfy `overlap_tokens < target_tokens <= max_tokens`.
///
/// # Examples
///
/// ```
/// use bookbert::chunking::ChunkingOptions;
///
/// let options = ChunkingOptions::default();
/// assert_eq!(options.target_tokens, 400);
/// assert!(options.validate().is_ok());
///
/// assert!(ChunkingOptions::new(100, 80, 10).validate().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChunkingOptions {
    pub target_tokens: usize,
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            target_tokens: DEFAULT_TARGET_TOKENS,
            max_tokens: DEFAULT_MAX_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
        }
    }
}

impl ChunkingOptions {
    pub fn new(
        target_tokens: usize,
        max_tokens: usize,
        overlap_tokens: usize,
    ) -> Self {
        Self {
            target_tokens,
            max_tokens,
            overlap_tokens,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_tokens == 0 {
            return Err(Error::Config(
                "target_tokens must be greater than zero".to_string(),
            ));
        }
        if self.target_tokens > self.max_tokens {
            return Err(Error::Config(format!(
                "target_tokens ({}) must not exceed max_tokens ({})",
                self.target_tokens, self.max_tokens
            )));
        }
        if self.overlap_tokens >= self.target_tokens {
            return Err(Error::Config(format!(
                "overlap_tokens ({}) must be smaller than target_tokens ({})",
                self.overlap_tokens, self.target_tokens
            )));
        }
        Ok(())
    }
}

/// A passage produced by the chunker, before it is attached to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChunk {
    pub text: String,
    pub offset_start: usize,
    pub offset_end: usize,
}

/// Chunk plain text whose paragraphs are separated by blank lines.
///
/// This is a pure function with no I/O.
///
/// # Examples
///
/// ```
/// use bookbert::chunking::{chunk_text, ChunkingOptions};
///
/// let text = "Paragraph one.\n\nParagraph two.\n\nParagraph three.";
/// let chunks = chunk_text(text, &ChunkingOptions::new(3, 8, 0));
/// assert_eq!(chunks[0].text, "Paragraph one.");
/// assert_eq!(chunks.len(), 3);
/// ```
pub fn chunk_text(text: &str, options: &ChunkingOptions) -> Vec<RawChunk> {
    chunk_paragraphs(&split_into_paragraphs(text), options)
}

/// Chunk a chapter's markup: paragraph extraction followed by packing.
pub fn chunk_markup(markup: &str, options: &ChunkingOptions) -> Vec<RawChunk> {
    chunk_paragraphs(&extract_paragraphs(markup), options)
}

/// Whole paragraphs waiting to be emitted as one chunk.
#[derive(Default)]
struct ParagraphBuffer<'a> {
    paragraphs: Vec<(&'a str, usize)>,
    tokens: usize,
}

impl<'a> ParagraphBuffer<'a> {
    fn is_empty(&self) -> bool {
        self.paragraphs.is_empty()
    }

    fn push(&mut self, paragraph: &'a str, tokens: usize) {
        self.paragraphs.push((paragraph, tokens));
        self.tokens += tokens;
    }

    fn clear(&mut self) {
        self.paragraphs.clear();
        self.tokens = 0;
    }

    fn to_chunk(&self, offset_start: usize, offset_end: usize) -> RawChunk {
        let text = self
            .paragraphs
            .iter()
            .map(|(p, _)| *p)
            .collect::<Vec<_>>()
            .join("\n\n");
        RawChunk {
            text: text.trim().to_string(),
            offset_start,
            offset_end,
        }
    }

    /// Keep only the trailing paragraphs that make up the overlap.
    ///
    /// Walks backwards until at least `overlap` tokens are kept, but never
    /// keeps more than `budget` tokens so the next chunk stays within the
    /// hard ceiling once the incoming paragraph is added.
    fn retain_overlap(&mut self, overlap: usize, budget: usize) {
        if overlap == 0 {
            self.clear();
            return;
        }

        let mut kept = 0;
        let mut tokens = 0;
        for &(_, count) in self.paragraphs.iter().rev() {
            if tokens + count > budget {
                break;
            }
            kept += 1;
            tokens += count;
            if tokens >= overlap {
                break;
            }
        }

        self.paragraphs.drain(..self.paragraphs.len() - kept);
        self.tokens = tokens;
    }
}

/// Group paragraphs into overlapping chunks.
pub fn chunk_paragraphs<S: AsRef<str>>(
    paragraphs: &[S],
    options: &ChunkingOptions,
) -> Vec<RawChunk> {
    let mut chunks = Vec::new();
    let mut buffer = ParagraphBuffer::default();
    let mut offset = 0;
    let mut chunk_start = 0;

    for paragraph in paragraphs {
        let paragraph = paragraph.as_ref();
        let tokens = estimate_token_count(paragraph);

        if tokens > options.max_tokens {
            if !buffer.is_empty() {
                chunks.push(buffer.to_chunk(chunk_start, offset));
                buffer.clear();
            }
            for piece in split_long_paragraph(paragraph, options, offset) {
                offset = piece.offset_end;
                chunks.push(piece);
            }
            chunk_start = offset;
            continue;
        }

        if buffer.tokens + tokens > options.target_tokens && !buffer.is_empty() {
            chunks.push(buffer.to_chunk(chunk_start, offset));
            buffer.retain_overlap(
                options.overlap_tokens,
                options.max_tokens - tokens,
            );
            chunk_start = offset.saturating_sub(buffer.tokens);
        }

        buffer.push(paragraph, tokens);
        offset += tokens;
    }

    if !buffer.is_empty() {
        chunks.push(buffer.to_chunk(chunk_start, offset));
    }

    chunks
}

/// Split a paragraph that exceeds `max_tokens` on its own.
///
/// Sentences are packed up to `target_tokens`; a sentence that alone
/// exceeds `max_tokens` falls through to [`split_by_word_windows`].
fn split_long_paragraph(
    paragraph: &str,
    options: &ChunkingOptions,
    mut offset: usize,
) -> Vec<RawChunk> {
    let mut sentences: Vec<&str> =
        SENTENCE.find_iter(paragraph).map(|m| m.as_str()).collect();
    if sentences.is_empty() {
        sentences.push(paragraph);
    }

    let mut pieces = Vec::new();
    let mut buffer = String::new();
    let mut buffer_tokens = 0;

    for sentence in sentences {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        let sentence_tokens = estimate_token_count(sentence);

        if sentence_tokens > options.max_tokens {
            if !buffer.is_empty() {
                pieces.push(RawChunk {
                    text: std::mem::take(&mut buffer),
                    offset_start: offset,
                    offset_end: offset + buffer_tokens,
                });
                offset += buffer_tokens;
                buffer_tokens = 0;
            }
            let windows = split_by_word_windows(sentence, options, offset);
            if let Some(last) = windows.last() {
                offset = last.offset_end;
            }
            pieces.extend(windows);
            continue;
        }

        if buffer_tokens + sentence_tokens > options.target_tokens
            && buffer_tokens > 0
        {
            pieces.push(RawChunk {
                text: std::mem::replace(&mut buffer, sentence.to_string()),
                offset_start: offset,
                offset_end: offset + buffer_tokens,
            });
            offset += buffer_tokens;
            buffer_tokens = sentence_tokens;
            continue;
        }

        if !buffer.is_empty() {
            buffer.push(' ');
        }
        buffer.push_str(sentence);
        buffer_tokens += sentence_tokens;
    }

    if !buffer.is_empty() {
        pieces.push(RawChunk {
            text: buffer,
            offset_start: offset,
            offset_end: offset + buffer_tokens,
        });
    }

    pieces
}

/// Last-resort split into windows of `target_tokens` whitespace-delimited
/// words, overlapping by `overlap_tokens` words.
///
/// A window whose token estimate exceeds `max_tokens` (hyphenated or
/// otherwise multi-token words) is shrunk one word at a time. Every
/// iteration moves `start` forward, so the loop terminates for any input.
fn split_by_word_windows(
    sentence: &str,
    options: &ChunkingOptions,
    offset: usize,
) -> Vec<RawChunk> {
    let words: Vec<&str> = sentence
        .split_whitespace()
        .flat_map(|word| explode_word(word, options))
        .collect();
    if words.is_empty() {
        return Vec::new();
    }

    // prefix[i] = tokens in words[..i]
    let mut prefix = Vec::with_capacity(words.len() + 1);
    prefix.push(0);
    for word in &words {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + estimate_token_count(word));
    }

    let window = options.target_tokens.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < words.len() {
        let mut end = (start + window).min(words.len());
        while end > start + 1 && prefix[end] - prefix[start] > options.max_tokens
        {
            end -= 1;
        }

        chunks.push(RawChunk {
            text: words[start..end].join(" "),
            offset_start: offset + start,
            offset_end: offset + end,
        });

        if end == words.len() {
            break;
        }
        start = end.saturating_sub(options.overlap_tokens).max(start + 1);
    }

    chunks
}

/// Cut a single word that is larger than a whole chunk at token boundaries.
fn explode_word<'a>(word: &'a str, options: &ChunkingOptions) -> Vec<&'a str> {
    if estimate_token_count(word) <= options.max_tokens {
        return vec![word];
    }

    let spans = token_spans(word);
    let group = options.target_tokens.max(1);
    let mut cuts: Vec<usize> = spans
        .iter()
        .step_by(group)
        .skip(1)
        .map(|&(start, _)| start)
        .collect();
    cuts.insert(0, 0);
    cuts.push(word.len());

    cuts.windows(2)
        .map(|w| &word[w[0]..w[1]])
        .filter(|piece| !piece.is_empty())
        .collect()
}
