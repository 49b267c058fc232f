//! Block-level paragraph extraction from chapter markup.
//!
//! Extraction is regex based so that it behaves identically on the calling
//! task and inside the background indexing worker.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::tokenizer::split_into_paragraphs;

/// Elements whose text content becomes one paragraph each.
const BLOCK_TAGS: [&str; 9] = [
    "p",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "blockquote",
    "li",
];

static BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    let alternatives: Vec<String> = BLOCK_TAGS
        .iter()
        .map(|tag| format!(r"<{tag}\b[^>]*>(.*?)</{tag}\s*>"))
        .collect();
    Regex::new(&format!("(?is){}", alternatives.join("|")))
        .expect("block pattern is valid")
});

static NON_CONTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>|<!--.*?-->")
        .expect("non-content pattern is valid")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag pattern is valid"));

static ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|amp|lt|gt|quot|apos|nbsp);")
        .expect("entity pattern is valid")
});

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Collapse every whitespace run to a single space and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}

/// Extract plain-text paragraphs from chapter markup, in document order.
///
/// Text of `p`, `h1`..`h6`, `blockquote` and `li` elements is collected with
/// nested tags removed and whitespace collapsed. Markup without any of those
/// elements (including plain text) is split on blank lines instead.
///
/// # Examples
///
/// ```
/// use bookbert::paragraphs::extract_paragraphs;
///
/// let html = "<h1>Chapter  One</h1><p>It was a <em>bright</em> day.</p>";
/// assert_eq!(extract_paragraphs(html), vec!["Chapter One", "It was a bright day."]);
///
/// let plain = "First paragraph.\n\nSecond paragraph.";
/// assert_eq!(extract_paragraphs(plain), vec!["First paragraph.", "Second paragraph."]);
/// ```
pub fn extract_paragraphs(markup: &str) -> Vec<String> {
    let content = NON_CONTENT.replace_all(markup, " ");

    let paragraphs: Vec<String> = BLOCK
        .captures_iter(&content)
        .filter_map(|caps| {
            let inner = caps.iter().skip(1).flatten().next()?;
            let text = normalize_whitespace(&decode_entities(
                &TAG.replace_all(inner.as_str(), " "),
            ));
            (!text.is_empty()).then_some(text)
        })
        .collect();

    if !paragraphs.is_empty() {
        return paragraphs;
    }

    let stripped = decode_entities(&TAG.replace_all(&content, " "));
    split_into_paragraphs(&stripped)
        .iter()
        .map(|p| normalize_whitespace(p))
        .filter(|p| !p.is_empty())
        .collect()
}

/// Decode the handful of entities that commonly appear in book markup.
///
/// Unknown or malformed references are left untouched.
fn decode_entities(text: &str) -> String {
    ENTITY
        .replace_all(text, |caps: &Captures<'_>| {
            let name = &caps[1];
            let decoded = match name {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some(' '),
                _ => numeric_reference(name),
            };
            decoded.map_or_else(|| caps[0].to_string(), |c| c.to_string())
        })
        .into_owned()
}

fn numeric_reference(reference: &str) -> Option<char> {
    let digits = reference.strip_prefix('#')?;
    let code = match digits.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    char::from_u32(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_block_elements_in_order() {
        let html = "<body><h2>Title</h2><p>One.</p><blockquote>Quote.</blockquote>\
                    <ul><li>Item</li></ul></body>";
        assert_eq!(
            extract_paragraphs(html),
            vec!["Title", "One.", "Quote.", "Item"]
        );
    }

    #[test]
    fn nested_tags_are_stripped_and_whitespace_collapsed() {
        let html = "<p class=\"x\">Some\n   <b>bold</b>\t<i>text</i></p>";
        assert_eq!(extract_paragraphs(html), vec!["Some bold text"]);
    }

    #[test]
    fn tag_names_match_exactly() {
        let html = "<pre>code</pre><p>prose</p>";
        assert_eq!(extract_paragraphs(html), vec!["prose"]);
    }

    #[test]
    fn uppercase_tags_are_recognised() {
        assert_eq!(extract_paragraphs("<P>Loud</P>"), vec!["Loud"]);
    }

    #[test]
    fn empty_blocks_are_dropped() {
        let html = "<p>   </p><p><br/></p><p>Kept</p>";
        assert_eq!(extract_paragraphs(html), vec!["Kept"]);
    }

    #[test]
    fn entities_are_decoded() {
        let html = "<p>Fish &amp; chips &lt;3 &#8212; caf&#xE9;&nbsp;time</p>";
        assert_eq!(extract_paragraphs(html), vec!["Fish & chips <3 — café time"]);
    }

    #[test]
    fn unknown_entities_are_left_alone() {
        assert_eq!(extract_paragraphs("<p>&bogus; &#xZZ;</p>"), vec!["&bogus; &#xZZ;"]);
    }

    #[test]
    fn script_and_style_bodies_are_ignored() {
        let html = "<style>p { color: red }</style><script>var p = '<p>no</p>';</script>\
                    <p>yes</p>";
        assert_eq!(extract_paragraphs(html), vec!["yes"]);
    }

    #[test]
    fn falls_back_to_blank_line_split_without_blocks() {
        let html = "<div>Apples are crisp.</div>\n\n<div>They grow\n in orchards.</div>";
        assert_eq!(
            extract_paragraphs(html),
            vec!["Apples are crisp.", "They grow in orchards."]
        );
    }

    #[test]
    fn plain_text_without_markup() {
        assert_eq!(extract_paragraphs("just words"), vec!["just words"]);
        assert!(extract_paragraphs("").is_empty());
        assert!(extract_paragraphs("<div> </div>").is_empty());
    }
}
