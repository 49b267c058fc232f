//! Word tokenization used for chunk sizing and lexical scoring.
//!
//! Token counts produced here approximate what an LLM tokenizer would report
//! but are only ever used for relative sizing decisions.

use std::sync::LazyLock;

use regex::Regex;

static WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-z0-9]+(?:'[a-z0-9]+)?").expect("word pattern is valid")
});

static BLANK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("blank line pattern is valid"));

/// Split text into lowercase word tokens.
///
/// A token is a run of ASCII letters and digits, optionally containing a
/// single internal apostrophe, so `don't` stays one token while surrounding
/// punctuation is dropped.
///
/// # Examples
///
/// ```
/// use bookbert::tokenizer::tokenize;
///
/// assert_eq!(tokenize("Don't PANIC, Arthur!"), vec!["don't", "panic", "arthur"]);
/// ```
pub fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    WORD.find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Number of tokens [`tokenize`] would return, without allocating them.
pub fn estimate_token_count(text: &str) -> usize {
    let lower = text.to_lowercase();
    WORD.find_iter(&lower).count()
}

/// Byte ranges of each token within `text`.
///
/// Used by the chunker to cut a pathological word that is longer than a
/// whole chunk on token boundaries. Yields exactly as many spans as
/// [`estimate_token_count`] counts tokens, including for characters such
/// as `İ` or the Kelvin sign whose lowercase form is a different length.
pub(crate) fn token_spans(text: &str) -> Vec<(usize, usize)> {
    let mut lower = String::with_capacity(text.len());
    // Byte range in `text` of the character each byte of `lower` came from.
    let mut origin: Vec<(usize, usize)> = Vec::with_capacity(text.len());
    for (start, ch) in text.char_indices() {
        let end = start + ch.len_utf8();
        for lowered in ch.to_lowercase() {
            lower.push(lowered);
        }
        origin.resize(lower.len(), (start, end));
    }

    WORD.find_iter(&lower)
        .map(|m| (origin[m.start()].0, origin[m.end() - 1].1))
        .collect()
}

/// Split plain text into paragraphs on blank lines, trimming each and
/// dropping empty ones.
pub fn split_into_paragraphs(text: &str) -> Vec<String> {
    BLANK_LINE
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
