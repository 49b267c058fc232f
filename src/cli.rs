use std::path::PathBuf;

use bookbert::{ChunkingOptions, SearchScope};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "bookbert",
    about = "Passage search for long documents: chunking, BM25 and embeddings"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the ColBERT model ID or local model path
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Embedding provider used for backfill and hybrid search
    #[arg(long, value_enum, default_value_t = EmbedderKind::Colbert, global = true)]
    pub embedder: EmbedderKind,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors, hide progress bars
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EmbedderKind {
    /// In-process ColBERT model, pooled to one vector per passage
    Colbert,
    /// Deterministic n-gram hashing, no model download
    Hash,
    /// No embeddings; search is lexical only
    None,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Chunk a document, persist it, and backfill embeddings
    Index(IndexArgs),
    /// Delete a document's chunks and index it again
    Reindex(IndexArgs),
    /// Search passages of an indexed document
    Search(SearchArgs),
    /// Print a chunk by id
    Get(GetArgs),
    /// Chunk a file and print the passages without storing anything
    Chunk(ChunkArgs),
    /// Show indexed documents and embedding coverage
    Status(StatusArgs),
    /// Remove a document and all its chunks
    Remove {
        /// Document id
        document: String,
    },
    /// Manage the ColBERT model configuration
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
    /// Manage persisted retrieval settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Model --

#[derive(Debug, Subcommand)]
pub enum ModelAction {
    /// Show the currently resolved model
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a default model ID or local path in config.redb
    Set {
        /// Model ID (HuggingFace) or local path
        model: String,
    },
    /// Clear the stored model setting (revert to default)
    Clear,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show every setting with its effective value
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting
    Set { key: String, value: String },
    /// Remove a persisted setting
    Unset { key: String },
}

// -- Chunking flags --

#[derive(Debug, Clone, Default, Args)]
pub struct ChunkingArgs {
    /// Soft passage size in tokens
    #[arg(long)]
    pub target_tokens: Option<usize>,

    /// Hard passage size limit in tokens
    #[arg(long)]
    pub max_tokens: Option<usize>,

    /// Tokens of trailing context carried into the next passage
    #[arg(long)]
    pub overlap_tokens: Option<usize>,
}

impl ChunkingArgs {
    pub fn apply(&self, base: ChunkingOptions) -> ChunkingOptions {
        ChunkingOptions {
            target_tokens: self.target_tokens.unwrap_or(base.target_tokens),
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
            overlap_tokens: self.overlap_tokens.unwrap_or(base.overlap_tokens),
        }
    }
}

// -- Index / Reindex --

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// A JSON document ({id, title, chapters: [{id, title, html}]}), or an
    /// HTML / text file indexed as a single chapter
    pub path: PathBuf,

    /// Document id (defaults to the id in the JSON, or the file stem)
    #[arg(long)]
    pub id: Option<String>,

    /// Document title
    #[arg(long)]
    pub title: Option<String>,

    #[command(flatten)]
    pub chunking: ChunkingArgs,

    /// Do not compute embeddings after chunking
    #[arg(long)]
    pub no_embeddings: bool,

    /// Chunk on the calling thread instead of the indexing thread
    #[arg(long)]
    pub inline: bool,

    /// Output the report as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Document to search
    #[arg(short = 'd', long)]
    pub document: String,

    /// Restrict the search to one chapter
    #[arg(short = 'c', long)]
    pub chapter: Option<String>,

    /// Search scope; `chapter` requires --chapter
    #[arg(long, value_enum)]
    pub scope: Option<SearchScope>,

    /// Number of results to return
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

impl SearchArgs {
    /// `--chapter` implies chapter scope unless a scope is given.
    pub fn effective_scope(&self) -> SearchScope {
        self.scope.unwrap_or(if self.chapter.is_some() {
            SearchScope::Chapter
        } else {
            SearchScope::WholeDocument
        })
    }
}

// -- Get --

#[derive(Debug, Parser)]
pub struct GetArgs {
    /// Chunk id, e.g. moby-ch1-chunk-7
    pub id: String,

    /// Output as JSON, including the embedding if present
    #[arg(long)]
    pub json: bool,
}

// -- Chunk --

#[derive(Debug, Parser)]
pub struct ChunkArgs {
    /// HTML or plain-text file
    pub path: PathBuf,

    #[command(flatten)]
    pub chunking: ChunkingArgs,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "bookbert",
            &mut std::io::stdout(),
        );
    }
}
