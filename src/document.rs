//! Documents, chapters and the chunks derived from them.

use serde::{Deserialize, Serialize};

use crate::chunking::RawChunk;

/// One chapter of a document as handed over by the document source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub chapters: Vec<Chapter>,
}

impl Document {
    /// Wrap a single block of markup (or plain text) as a one-chapter
    /// document. The chapter id is `"1"`.
    pub fn from_markup(
        id: impl Into<String>,
        title: impl Into<String>,
        markup: impl Into<String>,
    ) -> Self {
        let title = title.into();
        Self {
            id: id.into(),
            chapters: vec![Chapter {
                id: "1".to_string(),
                title: title.clone(),
                html: markup.into(),
            }],
            title,
        }
    }
}

/// The atomic retrievable unit.
///
/// Chunks are immutable once persisted; attaching an embedding later is a
/// full replacement keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chapter_id: String,
    pub chapter_title: String,
    pub composite_key: String,
    pub text: String,
    pub offset_start: usize,
    pub offset_end: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
}

impl Chunk {
    /// Attach chapter provenance to a chunker output.
    ///
    /// `index` is the document-wide sequence number of this chunk within
    /// the current indexing run.
    pub fn from_raw(
        raw: RawChunk,
        document_id: &str,
        chapter: &Chapter,
        index: usize,
    ) -> Self {
        Self {
            id: chunk_id(document_id, &chapter.id, index),
            document_id: document_id.to_string(),
            chapter_id: chapter.id.clone(),
            chapter_title: chapter.title.clone(),
            composite_key: composite_key(document_id, &chapter.id),
            text: raw.text,
            offset_start: raw.offset_start,
            offset_end: raw.offset_end,
            embedding: None,
            embedding_model: None,
        }
    }

    /// Whether this chunk carries a non-empty vector produced by `model`.
    pub fn has_embedding_from(&self, model: &str) -> bool {
        self.embedding.as_ref().is_some_and(|v| !v.is_empty())
            && self.embedding_model.as_deref() == Some(model)
    }

    /// The sequence number encoded in the chunk id, if it has one.
    pub fn sequence(&self) -> Option<usize> {
        chunk_sequence(&self.id)
    }
}

/// Deterministic chunk id: `{document}-{chapter}-chunk-{index}`.
///
/// # Examples
///
/// ```
/// use bookbert::document::chunk_id;
///
/// assert_eq!(chunk_id("moby", "ch1", 7), "moby-ch1-chunk-7");
/// ```
pub fn chunk_id(document_id: &str, chapter_id: &str, index: usize) -> String {
    format!("{document_id}-{chapter_id}-chunk-{index}")
}

/// Key used for chapter-scoped lookups: `{document}:{chapter}`.
pub fn composite_key(document_id: &str, chapter_id: &str) -> String {
    format!("{document_id}:{chapter_id}")
}

/// Parse the trailing sequence number out of a chunk id.
pub fn chunk_sequence(id: &str) -> Option<usize> {
    let (_, index) = id.rsplit_once("-chunk-")?;
    index.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter() -> Chapter {
        Chapter {
            id: "c2".to_string(),
            title: "Second".to_string(),
            html: String::new(),
        }
    }

    #[test]
    fn from_raw_derives_ids() {
        let raw = RawChunk {
            text: "Some text.".to_string(),
            offset_start: 3,
            offset_end: 5,
        };
        let chunk = Chunk::from_raw(raw, "doc", &chapter(), 4);

        assert_eq!(chunk.id, "doc-c2-chunk-4");
        assert_eq!(chunk.composite_key, "doc:c2");
        assert_eq!(chunk.chapter_title, "Second");
        assert_eq!(chunk.sequence(), Some(4));
        assert!(chunk.embedding.is_none());
    }

    #[test]
    fn chunk_sequence_handles_dashes_in_ids() {
        assert_eq!(chunk_sequence("my-doc-ch-1-chunk-12"), Some(12));
        assert_eq!(chunk_sequence("no-sequence"), None);
        assert_eq!(chunk_sequence("doc-c-chunk-x"), None);
    }

    #[test]
    fn has_embedding_from_checks_model() {
        let mut chunk = Chunk::from_raw(
            RawChunk {
                text: String::new(),
                offset_start: 0,
                offset_end: 0,
            },
            "doc",
            &chapter(),
            0,
        );
        assert!(!chunk.has_embedding_from("m"));

        chunk.embedding = Some(vec![1.0, 0.0]);
        chunk.embedding_model = Some("m".to_string());
        assert!(chunk.has_embedding_from("m"));
        assert!(!chunk.has_embedding_from("other"));

        chunk.embedding = Some(Vec::new());
        assert!(!chunk.has_embedding_from("m"));
    }

    #[test]
    fn chunk_json_uses_camel_case_and_skips_missing_embedding() {
        let chunk = Chunk::from_raw(
            RawChunk {
                text: "t".to_string(),
                offset_start: 0,
                offset_end: 1,
            },
            "doc",
            &chapter(),
            0,
        );
        let json = serde_json::to_value(&chunk).unwrap();

        assert_eq!(json["compositeKey"], "doc:c2");
        assert_eq!(json["offsetEnd"], 1);
        assert!(json.get("embedding").is_none());
        assert!(json.get("embeddingModel").is_none());

        let back: Chunk = serde_json::from_value(json).unwrap();
        assert_eq!(back, chunk);
    }

    #[test]
    fn document_from_markup_has_one_chapter() {
        let doc = Document::from_markup("d", "Title", "<p>x</p>");
        assert_eq!(doc.chapters.len(), 1);
        assert_eq!(doc.chapters[0].id, "1");
        assert_eq!(doc.chapters[0].title, "Title");
    }

    #[test]
    fn document_json_title_is_optional() {
        let doc: Document = serde_json::from_str(
            r#"{"id":"d","chapters":[{"id":"1","html":"<p>a</p>"}]}"#,
        )
        .unwrap();
        assert_eq!(doc.title, "");
        assert_eq!(doc.chapters[0].title, "");
    }
}
