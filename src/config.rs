//! Retrieval tunables.
//!
//! Values are resolved in order: built-in defaults, then settings persisted
//! in `config.redb`, then `BOOKBERT_*` environment variables. Command-line
//! flags are applied last by the binary.

use serde::{Deserialize, Serialize};

use crate::{
    backfill::DEFAULT_EMBEDDING_BATCH_SIZE,
    chunking::ChunkingOptions,
    config_db::ConfigDb,
    error::{Error, Result},
    protocol::DEFAULT_CHUNK_BATCH_SIZE,
    ranking::DEFAULT_RRF_K,
    scheduler::DEFAULT_YIELD_EVERY,
    search::DEFAULT_TOP_K,
};

/// Prefix of retrieval keys in the settings table.
pub const SETTING_PREFIX: &str = "retrieval.";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "BOOKBERT_";

/// Every key [`RetrievalConfig::apply`] understands.
pub const KEYS: &[&str] = &[
    "target_tokens",
    "max_tokens",
    "overlap_tokens",
    "chunk_batch_size",
    "embedding_batch_size",
    "top_k",
    "rrf_k",
    "inline_yield_every",
    "generate_embeddings",
    "auto_backfill",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrievalConfig {
    pub chunking: ChunkingOptions,
    pub chunk_batch_size: usize,
    pub embedding_batch_size: usize,
    pub top_k: usize,
    pub rrf_k: u32,
    /// Chapters between cooperative yields when chunking inline.
    pub inline_yield_every: usize,
    /// Queue embedding backfill after indexing.
    pub generate_embeddings: bool,
    /// Start draining the backfill queue in the background as soon as
    /// something is queued.
    pub auto_backfill: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingOptions::default(),
            chunk_batch_size: DEFAULT_CHUNK_BATCH_SIZE,
            embedding_batch_size: DEFAULT_EMBEDDING_BATCH_SIZE,
            top_k: DEFAULT_TOP_K,
            rrf_k: DEFAULT_RRF_K,
            inline_yield_every: DEFAULT_YIELD_EVERY,
            generate_embeddings: true,
            auto_backfill: true,
        }
    }
}

impl RetrievalConfig {
    /// Defaults, then persisted settings, then the environment. Validated.
    pub fn load(config_db: &ConfigDb) -> Result<Self> {
        let mut config = Self::default();
        config.apply_from(|key| config_db.get_setting(&setting_key(key)))?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        let sizes = [
            ("chunk_batch_size", self.chunk_batch_size),
            ("embedding_batch_size", self.embedding_batch_size),
            ("top_k", self.top_k),
            ("inline_yield_every", self.inline_yield_every),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than 0")));
            }
        }
        Ok(())
    }

    /// Set one value by key, parsing it from text.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "target_tokens" => self.chunking.target_tokens = parse(key, value)?,
            "max_tokens" => self.chunking.max_tokens = parse(key, value)?,
            "overlap_tokens" => self.chunking.overlap_tokens = parse(key, value)?,
            "chunk_batch_size" => self.chunk_batch_size = parse(key, value)?,
            "embedding_batch_size" => self.embedding_batch_size = parse(key, value)?,
            "top_k" => self.top_k = parse(key, value)?,
            "rrf_k" => self.rrf_k = parse(key, value)?,
            "inline_yield_every" => self.inline_yield_every = parse(key, value)?,
            "generate_embeddings" => self.generate_embeddings = parse_bool(key, value)?,
            "auto_backfill" => self.auto_backfill = parse_bool(key, value)?,
            _ => return Err(Error::Config(format!("unknown setting: {key}"))),
        }
        Ok(())
    }

    /// The current value of `key` as text.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "target_tokens" => self.chunking.target_tokens.to_string(),
            "max_tokens" => self.chunking.max_tokens.to_string(),
            "overlap_tokens" => self.chunking.overlap_tokens.to_string(),
            "chunk_batch_size" => self.chunk_batch_size.to_string(),
            "embedding_batch_size" => self.embedding_batch_size.to_string(),
            "top_k" => self.top_k.to_string(),
            "rrf_k" => self.rrf_k.to_string(),
            "inline_yield_every" => self.inline_yield_every.to_string(),
            "generate_embeddings" => self.generate_embeddings.to_string(),
            "auto_backfill" => self.auto_backfill.to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Apply every key for which `lookup` has a value.
    pub fn apply_from(
        &mut self,
        mut lookup: impl FnMut(&str) -> Result<Option<String>>,
    ) -> Result<()> {
        for key in KEYS {
            if let Some(value) = lookup(key)? {
                self.apply(key, &value)?;
            }
        }
        Ok(())
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_from(|key| Ok(std::env::var(env_var(key)).ok()))
    }
}

/// Settings-table key for a config key.
pub fn setting_key(key: &str) -> String {
    format!("{SETTING_PREFIX}{key}")
}

/// Environment variable for a config key, e.g. `BOOKBERT_TOP_K`.
pub fn env_var(key: &str) -> String {
    format!("{ENV_PREFIX}{}", key.to_ascii_uppercase())
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::Config(format!("invalid value for {key}: '{value}' ({e})")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "invalid value for {key}: '{value}' (expected true or false)"
        ))),
    }
}
