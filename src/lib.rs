//! bookbert - passage retrieval for long-form reading.
//!
//! bookbert splits books into overlapping, token-bounded passages, ranks
//! them lexically with BM25 straight away, and fuses in embedding
//! similarity via reciprocal-rank fusion once vectors have been backfilled
//! in the background. Chunking runs on a dedicated indexing thread, or
//! inline with cooperative yields when no thread is available.
//!
//! # Quick start
//!
//! ```
//! use bookbert::{ChunkingOptions, Document, Retriever, SearchOptions};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let retriever = Retriever::in_memory();
//! let book = Document::from_markup(
//!     "fruit",
//!     "Fruit",
//!     "<p>Apples are crisp.</p><p>Bananas are sweet.</p>",
//! );
//!
//! retriever
//!     .index_document(&book, Some(ChunkingOptions::new(4, 6, 1)))
//!     .await
//!     .unwrap();
//!
//! let results = retriever
//!     .search("bananas", "fruit", &SearchOptions::default().with_top_k(1))
//!     .await
//!     .unwrap();
//! assert!(results[0].chunk.text.contains("Bananas"));
//! # });
//! ```
//!
//! Persistent storage uses [`ChunkDb`], a [redb](https://docs.rs/redb)
//! database implementing [`ChunkStore`].

pub mod backfill;
pub mod bm25;
pub mod chunk_db;
pub mod chunking;
pub mod config;
pub mod config_db;
pub mod data_dir;
pub mod document;
pub mod embedding;
pub mod error;
pub mod model_manager;
pub mod paragraphs;
pub mod protocol;
pub mod ranking;
pub mod retriever;
pub mod scheduler;
pub mod search;
pub mod status;
pub mod store;
pub mod tokenizer;
pub mod worker;

pub use backfill::EmbeddingQueue;
pub use bm25::Bm25Index;
pub use chunk_db::ChunkDb;
pub use chunking::{ChunkingOptions, RawChunk, chunk_text};
pub use config::RetrievalConfig;
pub use config_db::ConfigDb;
pub use data_dir::DataDir;
pub use document::{Chapter, Chunk, Document};
pub use embedding::{EmbeddingProvider, HashEmbedder, LazyEmbedder};
pub use error::{Error, Result};
pub use model_manager::ColbertEmbedder;
pub use ranking::SearchResult;
pub use retriever::{IndexOutcome, IndexReport, Retriever};
pub use scheduler::{InlineScheduler, Scheduler, WorkerScheduler, select_scheduler};
pub use search::{SearchOptions, SearchScope};
pub use status::{IndexProgress, IndexState};
pub use store::{ChunkStore, MemoryChunkStore};
